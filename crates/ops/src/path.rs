//! Operation paths.
//!
//! A path is an ordered list of object keys and list indices addressing a
//! position in the document. On the wire it is a JSON array mixing
//! strings and numbers: `["data", "fldN", 0]`.

use serde::{Deserialize, Serialize};

use easygrid_core::FieldId;

/// The top-level document key under which record field data lives.
///
/// Record documents have the shape `{"data": {<fieldId>: value, ...}}`, so
/// every field edit's path starts with this segment.
pub const DATA_SEGMENT: &str = "data";

/// One step of a path: an object key or a list index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

impl PathSeg {
    /// Returns the key if this segment addresses an object.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSeg::Key(key) => Some(key),
            PathSeg::Index(_) => None,
        }
    }

    /// Returns the index if this segment addresses a list.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSeg::Index(index) => Some(*index),
            PathSeg::Key(_) => None,
        }
    }
}

impl From<&str> for PathSeg {
    fn from(key: &str) -> Self {
        PathSeg::Key(key.to_string())
    }
}

impl From<usize> for PathSeg {
    fn from(index: usize) -> Self {
        PathSeg::Index(index)
    }
}

/// A path into a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Path(pub Vec<PathSeg>);

impl Path {
    /// Builds a path from segments.
    pub fn new(segs: Vec<PathSeg>) -> Self {
        Self(segs)
    }

    /// Builds the path of a whole field cell: `["data", fieldId]`.
    pub fn field(field_id: &str) -> Self {
        Self(vec![PathSeg::from(DATA_SEGMENT), PathSeg::from(field_id)])
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when the path is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the segments.
    pub fn segs(&self) -> &[PathSeg] {
        &self.0
    }

    /// Returns the last segment.
    pub fn last(&self) -> Option<&PathSeg> {
        self.0.last()
    }

    /// Returns the field id this path addresses, if it is a field path:
    /// `["data", <fieldId>, ...]`.
    pub fn field_id(&self) -> Option<&FieldId> {
        match self.0.as_slice() {
            [PathSeg::Key(data), PathSeg::Key(field_id), ..] if data == DATA_SEGMENT => {
                Some(field_id)
            }
            _ => None,
        }
    }

    /// Returns true when the path addresses the whole field cell (exactly
    /// `["data", fieldId]`).
    pub fn is_whole_field(&self) -> bool {
        self.len() == 2 && self.field_id().is_some()
    }
}

impl core::fmt::Display for Path {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match seg {
                PathSeg::Key(key) => f.write_str(key)?,
                PathSeg::Index(index) => write!(f, "{}", index)?,
            }
        }
        Ok(())
    }
}

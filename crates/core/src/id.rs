//! Identifier types for EasyGrid.
//!
//! Tables, fields, and records are addressed by opaque string ids
//! (`tbl…`, `fld…`, `rec…`). Documents are addressed by a
//! `(collection, docId)` pair where the collection encodes the table.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of a user-defined table.
pub type TableId = String;

/// Identifier of a field (column) within a table.
pub type FieldId = String;

/// Identifier of a record (row) within a table.
pub type RecordId = String;

/// Identifier of a base (a group of tables).
pub type BaseId = String;

/// Identifier of a client connection, assigned at handshake.
pub type ConnectionId = String;

/// Prefix of record-document collections.
pub const RECORD_COLLECTION_PREFIX: &str = "rec_";

/// A document collection name.
///
/// Record documents live in the `rec_<tableId>` collection, one document
/// per record of that table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection(String);

impl Collection {
    /// Returns the record collection for a table.
    pub fn for_table(table_id: &str) -> Self {
        Self(format!("{}{}", RECORD_COLLECTION_PREFIX, table_id))
    }

    /// Parses a raw collection name, validating the `rec_` prefix.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() <= RECORD_COLLECTION_PREFIX.len() || !raw.starts_with(RECORD_COLLECTION_PREFIX)
        {
            return Err(Error::operation_invalid(format!(
                "unknown collection: {}",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the table id this collection addresses.
    pub fn table_id(&self) -> &str {
        &self.0[RECORD_COLLECTION_PREFIX.len()..]
    }

    /// Returns the raw collection name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Collection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The address of one document: `(collection, docId)`.
///
/// `DocumentKey` is `Ord` so that multi-document commits can publish in a
/// stable document order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: Collection,
    pub doc_id: RecordId,
}

impl DocumentKey {
    /// Creates a document key from a collection and document id.
    pub fn new(collection: Collection, doc_id: impl Into<RecordId>) -> Self {
        Self {
            collection,
            doc_id: doc_id.into(),
        }
    }

    /// Creates the document key of a record.
    pub fn for_record(table_id: &str, record_id: impl Into<RecordId>) -> Self {
        Self::new(Collection::for_table(table_id), record_id)
    }

    /// Returns the table id encoded in the collection.
    pub fn table_id(&self) -> &str {
        self.collection.table_id()
    }
}

impl core::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.collection, self.doc_id)
    }
}

//! Operations: lists of atomic edits applied with a single version bump.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use easygrid_core::{Fields, Result};

use crate::edit::AtomicEdit;

/// An operation: atomic edits applied in order, all or nothing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Operation {
    edits: Vec<AtomicEdit>,
}

impl Operation {
    /// Creates an empty operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an operation from edits.
    pub fn from_edits(edits: Vec<AtomicEdit>) -> Self {
        Self { edits }
    }

    /// Appends an edit.
    pub fn push(&mut self, edit: AtomicEdit) {
        self.edits.push(edit);
    }

    /// Returns the edits.
    pub fn edits(&self) -> &[AtomicEdit] {
        &self.edits
    }

    /// Number of edits.
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Returns true when the operation has no edits.
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Applies the operation to a document value, returning the new value.
    ///
    /// Edits apply left-to-right; any failure rejects the whole operation
    /// and the original document is untouched.
    pub fn apply(&self, document: &Value) -> Result<Value> {
        let mut next = document.clone();
        for edit in &self.edits {
            edit.apply(&mut next)?;
        }
        Ok(next)
    }

    /// Applies the operation to record field data.
    ///
    /// Record documents have the shape `{"data": {...fields}}`; this wraps
    /// the field map, applies, and unwraps.
    pub fn apply_to_data(&self, fields: &Fields) -> Result<Fields> {
        let document = json!({ "data": fields });
        let next = self.apply(&document)?;
        match next {
            Value::Object(mut map) => match map.remove("data") {
                Some(Value::Object(fields)) => Ok(fields),
                _ => Err(easygrid_core::Error::operation_invalid(
                    "operation removed the document data section",
                )),
            },
            _ => Err(easygrid_core::Error::operation_invalid(
                "operation replaced the document root",
            )),
        }
    }

    /// Composes this operation with a later one.
    ///
    /// When the later edit overwrites the same scalar path as an earlier
    /// one, the pair collapses into one edit keeping the earlier `od` and
    /// the later `oi`; numeric adds on the same path sum. Everything else
    /// accumulates in order.
    pub fn compose(&self, later: &Operation) -> Operation {
        let mut edits = self.edits.clone();
        'outer: for b in &later.edits {
            if b.is_scalar() || b.na.is_some() {
                for a in edits.iter_mut().rev() {
                    if a.p != b.p {
                        continue;
                    }
                    if let (Some(a_na), Some(b_na)) = (a.na, b.na) {
                        a.na = Some(a_na + b_na);
                        continue 'outer;
                    }
                    if a.is_scalar() && b.is_scalar() {
                        // Earlier od, later oi; either side may be an
                        // insert (no od) or delete (no oi).
                        let od = a.od.clone();
                        let oi = b.oi.clone();
                        *a = AtomicEdit {
                            p: a.p.clone(),
                            od,
                            oi,
                            ..Default::default()
                        };
                        continue 'outer;
                    }
                    break;
                }
            }
            edits.push(b.clone());
        }
        edits.retain(|edit| edit.kind().is_ok());
        Operation { edits }
    }

    /// Returns the inverse operation, used to roll back a partially
    /// persisted external write.
    pub fn invert(&self) -> Result<Operation> {
        let mut edits = Vec::with_capacity(self.edits.len());
        for edit in self.edits.iter().rev() {
            edits.push(edit.invert()?);
        }
        Ok(Operation { edits })
    }
}

impl FromIterator<AtomicEdit> for Operation {
    fn from_iter<T: IntoIterator<Item = AtomicEdit>>(iter: T) -> Self {
        Self {
            edits: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Operation {
    type Item = AtomicEdit;
    type IntoIter = std::vec::IntoIter<AtomicEdit>;

    fn into_iter(self) -> Self::IntoIter {
        self.edits.into_iter()
    }
}

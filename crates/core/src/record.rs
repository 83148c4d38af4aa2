//! Record rows.
//!
//! A record is the persistent projection of one document: a map of column
//! values keyed by field id (plus any scalar foreign-key columns), a
//! stable primary key, and a version kept in lockstep with the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::RecordId;
use crate::schema::TableSchema;

/// Column values of a record, keyed by field id or foreign-key column name.
pub type Fields = serde_json::Map<String, Value>;

/// One row of a user-defined table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable primary key.
    #[serde(rename = "__id")]
    pub id: RecordId,
    /// Monotonic version, equal to the number of committed op sets applied
    /// to this record's document. New rows start at 0 and reach 1 when the
    /// creating mutation commits.
    pub version: u64,
    /// Unix-millisecond timestamp of the last committed write.
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
    /// Column values.
    pub fields: Fields,
}

impl Record {
    /// Creates an empty record at version 0.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            updated_at: 0,
            fields: Fields::new(),
        }
    }

    /// Returns a column value, if set.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Returns a column value, treating absence as JSON null.
    pub fn get_or_null(&self, column: &str) -> Value {
        self.fields.get(column).cloned().unwrap_or(Value::Null)
    }

    /// Sets a column value; a null removes the column.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        if value.is_null() {
            self.fields.remove(&column);
        } else {
            self.fields.insert(column, value);
        }
    }

    /// Projects the document data: only columns that are schema field ids.
    ///
    /// Scalar foreign-key columns back the relationships but are never part
    /// of what subscribers see.
    pub fn document_data(&self, schema: &TableSchema) -> Fields {
        self.fields
            .iter()
            .filter(|(column, _)| schema.field(column).is_some())
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }
}

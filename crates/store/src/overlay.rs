//! Transaction-local view of row data.
//!
//! The write orchestrator computes all op sets (primary, derived, link)
//! before touching the store, so intermediate states live in an overlay:
//! a map of `(table, record) → fields` consulted before the committed
//! rows. Recomputation reads through it and writes into it, which is what
//! makes "values read within the current transaction" concrete.

use serde_json::Value;

use easygrid_core::{Fields, RecordId, Result, TableId};
use easygrid_ops::Operation;

use crate::store::RecordStore;

/// Uncommitted field states layered over the record store.
#[derive(Default)]
pub struct Overlay {
    entries: hashbrown::HashMap<(TableId, RecordId), Fields>,
    /// Records created in this transaction.
    created: Vec<(TableId, RecordId)>,
}

impl Overlay {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current fields of a record: the overlay state if
    /// present, the committed row otherwise. `None` when the record does
    /// not exist on either level.
    pub fn fields(&self, store: &RecordStore, table_id: &str, record_id: &str) -> Option<Fields> {
        if let Some(fields) = self
            .entries
            .get(&(table_id.to_string(), record_id.to_string()))
        {
            return Some(fields.clone());
        }
        store
            .get_record(table_id, record_id)
            .map(|record| record.fields.clone())
    }

    /// Returns one cell, treating a missing record or column as null.
    pub fn cell(&self, store: &RecordStore, table_id: &str, record_id: &str, column: &str) -> Value {
        self.fields(store, table_id, record_id)
            .and_then(|fields| fields.get(column).cloned())
            .unwrap_or(Value::Null)
    }

    /// Registers a record created in this transaction, starting empty.
    pub fn create(&mut self, table_id: &str, record_id: &str) {
        self.created
            .push((table_id.to_string(), record_id.to_string()));
        self.entries
            .insert((table_id.to_string(), record_id.to_string()), Fields::new());
    }

    /// Returns true when the record was created in this transaction.
    pub fn is_created(&self, table_id: &str, record_id: &str) -> bool {
        self.created
            .iter()
            .any(|(t, r)| t == table_id && r == record_id)
    }

    /// Applies an operation to a record's overlay state.
    pub fn apply(
        &mut self,
        store: &RecordStore,
        table_id: &str,
        record_id: &str,
        ops: &Operation,
    ) -> Result<()> {
        let current = self
            .fields(store, table_id, record_id)
            .unwrap_or_default();
        let next = ops.apply_to_data(&current)?;
        self.entries
            .insert((table_id.to_string(), record_id.to_string()), next);
        Ok(())
    }

    /// Overwrites a record's overlay state.
    pub fn set(&mut self, table_id: &str, record_id: &str, fields: Fields) {
        self.entries
            .insert((table_id.to_string(), record_id.to_string()), fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easygrid_core::{ConcreteType, FieldSchema, Record, TableSchemaBuilder};
    use easygrid_ops::{AtomicEdit, Path};
    use serde_json::json;

    fn store() -> RecordStore {
        let mut store = RecordStore::new();
        let schema = TableSchemaBuilder::new("tblA", "A")
            .add_field(FieldSchema::concrete("fldA", "A", ConcreteType::Number))
            .unwrap()
            .build()
            .unwrap();
        store.create_table(schema).unwrap();
        let mut record = Record::new("rec1");
        record.set("fldA", json!(1));
        let mut tx = crate::Transaction::begin();
        tx.insert_row(&mut store, "tblA", record).unwrap();
        tx.commit();
        store
    }

    #[test]
    fn test_reads_fall_through_to_store() {
        let store = store();
        let overlay = Overlay::new();
        assert_eq!(overlay.cell(&store, "tblA", "rec1", "fldA"), json!(1));
        assert!(overlay.fields(&store, "tblA", "recMissing").is_none());
    }

    #[test]
    fn test_overlay_shadows_store() {
        let store = store();
        let mut overlay = Overlay::new();
        let op = Operation::from_edits(vec![AtomicEdit::replace(
            Path::field("fldA"),
            json!(1),
            json!(9),
        )]);
        overlay.apply(&store, "tblA", "rec1", &op).unwrap();
        assert_eq!(overlay.cell(&store, "tblA", "rec1", "fldA"), json!(9));
        // The committed row is untouched.
        assert_eq!(
            store.get_record("tblA", "rec1").unwrap().get("fldA"),
            Some(&json!(1))
        );
    }

    #[test]
    fn test_created_records() {
        let store = store();
        let mut overlay = Overlay::new();
        overlay.create("tblA", "rec9");
        assert!(overlay.is_created("tblA", "rec9"));
        assert_eq!(overlay.fields(&store, "tblA", "rec9"), Some(Fields::new()));
    }
}

//! Transactions over the record store.
//!
//! The transaction is the only write path: it journals every change so a
//! rollback restores the exact prior state, and it owns the version
//! discipline. A row's version moves if and only if ops were applied to
//! it inside a transaction.

use serde_json::Value;

use easygrid_core::{link_cell_value, parse_link_cell, Error, Record, Result};
use easygrid_ops::Operation;

use crate::journal::{Journal, JournalEntry};
use crate::junction::JunctionRow;
use crate::now_ms;
use crate::store::RecordStore;

/// A journaled transaction.
pub struct Transaction {
    journal: Journal,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::begin()
    }
}

impl Transaction {
    /// Starts a transaction.
    pub fn begin() -> Self {
        Self {
            journal: Journal::new(),
        }
    }

    /// Inserts a fresh row at version 0. The creating mutation's ops then
    /// move it to version 1 through [`Transaction::apply_ops`].
    pub fn insert_row(
        &mut self,
        store: &mut RecordStore,
        table_id: &str,
        record: Record,
    ) -> Result<()> {
        let table = store.require_table_mut(table_id)?;
        table.insert(record.clone())?;
        self.journal.record(JournalEntry::RowInsert {
            table: table_id.to_string(),
            record,
        });
        Ok(())
    }

    /// Applies an operation to a row, bumping its version by exactly one.
    ///
    /// With `expected_version` set, the submission fails with
    /// `version_mismatch` if the persisted version has moved on. Internal
    /// writers (derived and link ops merged into the same commit) pass
    /// `None` and ride the row's current version.
    pub fn apply_ops(
        &mut self,
        store: &mut RecordStore,
        table_id: &str,
        record_id: &str,
        ops: &Operation,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let schema = store.schema(table_id)?.clone();
        let table = store.require_table_mut(table_id)?;
        let old = table
            .get(record_id)
            .cloned()
            .ok_or_else(|| Error::record_not_found(table_id, record_id))?;

        if let Some(expected) = expected_version {
            if old.version != expected {
                return Err(Error::version_mismatch(expected, old.version));
            }
        }

        let mut new = old.clone();
        new.fields = ops.apply_to_data(&old.fields)?;
        new.version = old.version + 1;
        new.updated_at = now_ms();

        // Reflect link cells into the scalar FK columns this row carries.
        for field in schema.link_fields() {
            let link = field.as_link().expect("link fields only");
            if !link.relationship.fk_on_self() {
                continue;
            }
            let cell = new.fields.get(&field.id).cloned().unwrap_or(Value::Null);
            let entries = parse_link_cell(&cell);
            match entries.first() {
                Some(entry) => new.set(link.self_key_name.clone(), Value::String(entry.id.clone())),
                None => new.set(link.self_key_name.clone(), Value::Null),
            }
            // Normalise the stored cell to the canonical cardinality shape.
            if !cell.is_null() {
                new.set(field.id.clone(), link_cell_value(&entries, link.is_multi()));
            }
        }

        table.update(record_id, new.clone())?;
        let version = new.version;
        self.journal.record(JournalEntry::RowUpdate {
            table: table_id.to_string(),
            old,
            new,
        });
        Ok(version)
    }

    /// Deletes a row.
    pub fn delete_row(
        &mut self,
        store: &mut RecordStore,
        table_id: &str,
        record_id: &str,
    ) -> Result<Record> {
        let table = store.require_table_mut(table_id)?;
        let record = table.remove(record_id)?;
        self.journal.record(JournalEntry::RowDelete {
            table: table_id.to_string(),
            record: record.clone(),
        });
        Ok(record)
    }

    /// Inserts a junction row (no-op when the pair already exists).
    pub fn insert_junction(
        &mut self,
        store: &mut RecordStore,
        junction: &str,
        row: JunctionRow,
    ) -> Result<()> {
        let jct = store.junction_mut(junction)?;
        if jct.insert(row.clone()) {
            self.journal.record(JournalEntry::JunctionInsert {
                junction: junction.to_string(),
                row,
            });
        }
        Ok(())
    }

    /// Deletes a junction row (no-op when the pair is absent).
    pub fn delete_junction(
        &mut self,
        store: &mut RecordStore,
        junction: &str,
        self_key: &str,
        foreign_key: &str,
    ) -> Result<()> {
        let jct = store.junction_mut(junction)?;
        if let Some(row) = jct.remove(self_key, foreign_key) {
            self.journal.record(JournalEntry::JunctionDelete {
                junction: junction.to_string(),
                row,
            });
        }
        Ok(())
    }

    /// Returns the journal entries recorded so far.
    pub fn changes(&self) -> &[JournalEntry] {
        self.journal.entries()
    }

    /// Commits, returning the journal.
    pub fn commit(self) -> Vec<JournalEntry> {
        self.journal.commit()
    }

    /// Rolls back every change recorded by this transaction.
    pub fn rollback(self, store: &mut RecordStore) {
        self.journal.rollback(store);
    }
}

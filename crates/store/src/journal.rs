//! Change journal for transactions.
//!
//! Every mutation inside a transaction is recorded here with enough state
//! to undo it exactly. Rollback replays the entries in reverse.

use easygrid_core::{Record, TableId};

use crate::junction::JunctionRow;
use crate::store::RecordStore;

/// A single journal entry representing one applied change.
#[derive(Clone, Debug)]
pub enum JournalEntry {
    /// A row was inserted.
    RowInsert { table: TableId, record: Record },
    /// A row was replaced.
    RowUpdate {
        table: TableId,
        old: Record,
        new: Record,
    },
    /// A row was deleted.
    RowDelete { table: TableId, record: Record },
    /// A junction row was inserted.
    JunctionInsert { junction: String, row: JunctionRow },
    /// A junction row was deleted.
    JunctionDelete { junction: String, row: JunctionRow },
}

impl JournalEntry {
    /// Returns the table (or junction) name this entry touches.
    pub fn target(&self) -> &str {
        match self {
            JournalEntry::RowInsert { table, .. }
            | JournalEntry::RowUpdate { table, .. }
            | JournalEntry::RowDelete { table, .. } => table,
            JournalEntry::JunctionInsert { junction, .. }
            | JournalEntry::JunctionDelete { junction, .. } => junction,
        }
    }
}

/// Journal of one transaction's changes.
#[derive(Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry.
    pub fn record(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Returns the entries in application order.
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the journal on commit.
    pub fn commit(self) -> Vec<JournalEntry> {
        self.entries
    }

    /// Undoes every entry against the store, newest first.
    pub fn rollback(self, store: &mut RecordStore) {
        if !self.entries.is_empty() {
            tracing::debug!(entries = self.entries.len(), "rolling back transaction");
        }
        for entry in self.entries.into_iter().rev() {
            match entry {
                JournalEntry::RowInsert { table, record } => {
                    store.undo_insert(&table, &record.id);
                }
                JournalEntry::RowUpdate { table, old, .. } => {
                    store.undo_to(&table, old);
                }
                JournalEntry::RowDelete { table, record } => {
                    store.undo_to(&table, record);
                }
                JournalEntry::JunctionInsert { junction, row } => {
                    store.undo_junction_insert(&junction, &row);
                }
                JournalEntry::JunctionDelete { junction, row } => {
                    store.undo_junction_delete(&junction, row);
                }
            }
        }
    }
}

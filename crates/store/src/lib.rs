//! The record store: the relational projection of documents.
//!
//! One physical row per record, in a dynamic table whose columns are field
//! ids plus the scalar foreign-key columns backing link relationships.
//! Every row carries a `version` kept in lockstep with its document; no
//! writer touches a row outside a journaled transaction that also bumps
//! that version.

pub mod journal;
pub mod junction;
pub mod overlay;
pub mod store;
pub mod table;
pub mod transaction;

pub use journal::{Journal, JournalEntry};
pub use junction::{JunctionRow, JunctionTable};
pub use overlay::Overlay;
pub use store::RecordStore;
pub use table::TableStore;
pub use transaction::Transaction;

/// Unix-millisecond wall clock, used only to stamp `updatedAt`.
pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

//! The commit hook.
//!
//! Ops produced inside a transaction must not leak before commit, and
//! once committed they must reach every affected document agent before
//! any of those agents processes a later unrelated op. The orchestrator
//! therefore buffers per-document bundles during the transaction body and
//! pushes them through this trait only after the commit succeeds, in
//! ascending document order, while still serialising against the next
//! commit.

use easygrid_core::DocumentKey;
use easygrid_ops::Operation;

/// Sink for committed per-document op bundles.
pub trait CommitPublisher: Send + Sync {
    /// A document advanced to `version` with `op` committed.
    fn publish(&self, key: &DocumentKey, version: u64, op: &Operation);

    /// A document's record was deleted.
    fn publish_deleted(&self, key: &DocumentKey);
}

/// Publisher used before a broker attaches (and in tests that only care
/// about storage effects).
pub struct NoopPublisher;

impl CommitPublisher for NoopPublisher {
    fn publish(&self, _key: &DocumentKey, _version: u64, _op: &Operation) {}

    fn publish_deleted(&self, _key: &DocumentKey) {}
}

//! The write orchestrator.
//!
//! Every mutation (an OT submission, a REST call, a reconciliation, a
//! field backfill) commits through this crate: one transaction that
//! validates the input, applies the primary ops, collects derived ops from
//! the calculation engine and link ops from the maintainer, persists the
//! lot with a single version bump per affected document, and only then
//! hands the per-document bundles to the publisher in document-id order.

pub mod idempotency;
pub mod orchestrator;
pub mod publisher;

pub use idempotency::IdempotencyCache;
pub use orchestrator::{CommitOutcome, CommittedDoc, WriteOrchestrator};
pub use publisher::{CommitPublisher, NoopPublisher};

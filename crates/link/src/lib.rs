//! Link-field maintenance.
//!
//! A user-declared relationship lives in three places at once: the JSON
//! link cells on both sides, the scalar foreign-key columns (or junction
//! rows) that back them, and the cached titles inside the cells. This
//! crate keeps the three in lockstep on every write, and houses the
//! out-of-band reconciler that repairs drift between them.

pub mod maintainer;
pub mod reconciler;

pub use maintainer::{LinkChange, LinkEffects, LinkMaintainer};
pub use reconciler::Reconciler;

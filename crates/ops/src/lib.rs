//! The operation model of the EasyGrid collaboration engine.
//!
//! Operations are lists of atomic edits in the JSON0 style: each edit
//! carries a path into the document and exactly one payload (object
//! insert/delete/replace, list insert/delete/move, numeric add).
//! Application is checked: a delete or replace whose `od` disagrees with
//! the current value fails the whole operation, and nothing is applied
//! partially.

pub mod edit;
pub mod operation;
pub mod path;

pub use edit::{AtomicEdit, EditKind};
pub use operation::Operation;
pub use path::{Path, PathSeg, DATA_SEGMENT};

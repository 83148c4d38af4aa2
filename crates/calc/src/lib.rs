//! The calculation engine.
//!
//! Derived fields (formula, lookup, rollup, count) are recomputed after
//! every write: the dependency graph gives the transitive dirty closure in
//! topological order, and each dirty cell is evaluated against the values
//! visible inside the current transaction. Evaluation is deterministic
//! (no clocks, no randomness) and failures become error *values* stored
//! in the cell, never transaction failures.

pub mod engine;
pub mod formula;
pub mod graph;

pub use engine::{CalculationEngine, DocOps};
pub use formula::{parse as parse_formula, Expr};
pub use graph::{DependencyGraph, NodeKey};

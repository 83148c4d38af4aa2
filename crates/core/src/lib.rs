//! Core types for the EasyGrid collaboration engine.
//!
//! This crate defines the vocabulary shared by every other crate in the
//! workspace: identifiers, field descriptors, cell values, record rows,
//! table schemas, and the common error type.

pub mod cell;
pub mod error;
pub mod field;
pub mod id;
pub mod record;
pub mod schema;

pub use cell::{error_value, is_error_value, link_cell_value, parse_link_cell, LinkCell};
pub use error::{Error, Result};
pub use field::{Aggregation, ConcreteType, FieldKind, FieldSchema, LinkDescriptor, Relationship};
pub use id::{BaseId, Collection, ConnectionId, DocumentKey, FieldId, RecordId, TableId};
pub use record::{Fields, Record};
pub use schema::{TableSchema, TableSchemaBuilder};

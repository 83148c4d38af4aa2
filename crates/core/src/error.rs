//! Error types for the EasyGrid collaboration engine.
//!
//! One error enum is shared across the workspace. Every variant maps onto
//! a stable protocol code (`code()`), which is what WebSocket clients and
//! REST callers see; the `Display` text is the human-readable detail.

use thiserror::Error;

/// Result type alias for EasyGrid operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for EasyGrid operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Authentication failed during handshake or upgrade.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The caller is authenticated but not allowed to act here.
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// Fetch of a document that does not exist.
    #[error("document not found: {collection}/{doc_id}")]
    DocumentNotFound { collection: String, doc_id: String },

    /// An op was submitted against a version other than the current one.
    #[error("version mismatch: submitted {submitted}, current {current}")]
    VersionMismatch { submitted: u64, current: u64 },

    /// Malformed op, unknown path, type mismatch, or failed od-equality check.
    #[error("invalid operation: {message}")]
    OperationInvalid { message: String },

    /// A field definition would introduce a dependency cycle.
    #[error("cycle detected: {message}")]
    CycleDetected { message: String },

    /// A subscriber overflowed its outbound queue and must re-subscribe.
    #[error("resync required: {message}")]
    ResyncRequired { message: String },

    /// Too many requests.
    #[error("rate limited")]
    RateLimited,

    /// A commit or transport operation exceeded its deadline.
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Referenced table does not exist.
    #[error("table not found: {table_id}")]
    TableNotFound { table_id: String },

    /// Referenced field does not exist on the table.
    #[error("field {field_id} not found in table {table_id}")]
    FieldNotFound { table_id: String, field_id: String },

    /// Referenced record does not exist in the table.
    #[error("record {record_id} not found in table {table_id}")]
    RecordNotFound { table_id: String, record_id: String },

    /// A cell value does not match the field's declared type.
    #[error("type mismatch for field {field_id}: {message}")]
    TypeMismatch { field_id: String, message: String },

    /// A required field is missing or null.
    #[error("required field {field_id} is missing")]
    RequiredField { field_id: String },

    /// Invalid table or field definition.
    #[error("invalid schema: {message}")]
    InvalidSchema { message: String },

    /// A uniqueness or relationship constraint was violated.
    #[error("constraint violation on {column}: {message}")]
    ConstraintViolation { column: String, message: String },

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Creates an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Error::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a document-not-found error.
    pub fn document_not_found(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Error::DocumentNotFound {
            collection: collection.into(),
            doc_id: doc_id.into(),
        }
    }

    /// Creates a version-mismatch error.
    pub fn version_mismatch(submitted: u64, current: u64) -> Self {
        Error::VersionMismatch { submitted, current }
    }

    /// Creates an invalid-operation error.
    pub fn operation_invalid(message: impl Into<String>) -> Self {
        Error::OperationInvalid {
            message: message.into(),
        }
    }

    /// Creates a cycle-detected error.
    pub fn cycle_detected(message: impl Into<String>) -> Self {
        Error::CycleDetected {
            message: message.into(),
        }
    }

    /// Creates a resync-required error.
    pub fn resync_required(message: impl Into<String>) -> Self {
        Error::ResyncRequired {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout {
            message: message.into(),
        }
    }

    /// Creates a table-not-found error.
    pub fn table_not_found(table_id: impl Into<String>) -> Self {
        Error::TableNotFound {
            table_id: table_id.into(),
        }
    }

    /// Creates a field-not-found error.
    pub fn field_not_found(table_id: impl Into<String>, field_id: impl Into<String>) -> Self {
        Error::FieldNotFound {
            table_id: table_id.into(),
            field_id: field_id.into(),
        }
    }

    /// Creates a record-not-found error.
    pub fn record_not_found(table_id: impl Into<String>, record_id: impl Into<String>) -> Self {
        Error::RecordNotFound {
            table_id: table_id.into(),
            record_id: record_id.into(),
        }
    }

    /// Creates a type-mismatch error.
    pub fn type_mismatch(field_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TypeMismatch {
            field_id: field_id.into(),
            message: message.into(),
        }
    }

    /// Creates a required-field error.
    pub fn required_field(field_id: impl Into<String>) -> Self {
        Error::RequiredField {
            field_id: field_id.into(),
        }
    }

    /// Creates an invalid-schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Error::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates a constraint-violation error.
    pub fn constraint_violation(column: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConstraintViolation {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Returns the stable protocol code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthorized { .. } => "unauthorized",
            Error::Forbidden { .. } => "forbidden",
            Error::DocumentNotFound { .. }
            | Error::TableNotFound { .. }
            | Error::RecordNotFound { .. } => "document_not_found",
            Error::VersionMismatch { .. } => "version_mismatch",
            Error::OperationInvalid { .. }
            | Error::FieldNotFound { .. }
            | Error::TypeMismatch { .. }
            | Error::RequiredField { .. }
            | Error::InvalidSchema { .. }
            | Error::ConstraintViolation { .. } => "operation_invalid",
            Error::CycleDetected { .. } => "cycle_detected",
            Error::ResyncRequired { .. } => "resync_required",
            Error::RateLimited => "rate_limited",
            Error::Timeout { .. } => "timeout",
            Error::Internal { .. } => "internal",
        }
    }

    /// Returns true if the client may retry this request as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

//! Error types for the GQX batch executor.
//!
//! All public APIs return `GqxResult<T>`: no panics in library code.

use thiserror::Error;

/// Unified error type for all GQX operations.
#[derive(Debug, Error)]
pub enum GqxError {
    /// Host or device buffer could not be allocated
    #[error("allocation failure: {what} ({bytes} bytes)")]
    AllocationFailure { what: String, bytes: usize },

    /// Asynchronous copy could not be enqueued or failed in flight
    #[error("copy failure: {0}")]
    CopyFailure(String),

    /// Stream drain reported a fault from an enqueued operation
    #[error("stream sync failure on device {device}: {message}")]
    SyncFailure { device: u32, message: String },

    /// Output expression could not be evaluated for a row
    #[error("evaluation failure at row {row}: {message}")]
    EvaluationFailure { row: i64, message: String },

    /// Operation called out of order for the current batch phase
    #[error("invalid operation: {message}\nContext: {context}")]
    InvalidOperation { message: String, context: String },

    /// Invalid arguments
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Type mismatch between expected and actual values
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Requested column does not exist in the batch
    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    /// Configuration could not be loaded or is invalid
    #[error("config error: {0}")]
    Config(String),

    /// GPU driver error outside the four core categories
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Query was cancelled between batches
    #[error("query cancelled")]
    Cancelled,

    /// Apache Arrow error (RecordBatch operations)
    #[error("arrow error: {source}")]
    Arrow {
        #[from]
        source: arrow::error::ArrowError,
    },

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Core failure categories surfaced to query-level fault handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    Copy,
    Sync,
    Evaluation,
    Other,
}

impl GqxError {
    /// Shorthand for an allocation failure.
    pub fn alloc(what: impl Into<String>, bytes: usize) -> Self {
        GqxError::AllocationFailure {
            what: what.into(),
            bytes,
        }
    }

    /// Shorthand for an evaluation failure at a row.
    pub fn eval(row: impl Into<i64>, message: impl Into<String>) -> Self {
        GqxError::EvaluationFailure {
            row: row.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GqxError::AllocationFailure { .. } => ErrorKind::Allocation,
            GqxError::CopyFailure(_) => ErrorKind::Copy,
            GqxError::SyncFailure { .. } => ErrorKind::Sync,
            GqxError::EvaluationFailure { .. }
            | GqxError::TypeMismatch { .. }
            | GqxError::ColumnNotFound(_) => ErrorKind::Evaluation,
            _ => ErrorKind::Other,
        }
    }
}

/// Result type alias for all GQX operations.
pub type GqxResult<T> = Result<T, GqxError>;

impl From<serde_json::Error> for GqxError {
    fn from(err: serde_json::Error) -> Self {
        GqxError::Serialization(err.to_string())
    }
}

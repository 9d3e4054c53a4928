use thiserror::Error;

use crate::record::ItemResult;

/// Failures reported by the underlying document store client.
///
/// The original message from the store is always preserved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Optimistic-concurrency conflict: the supplied revision is stale.
    #[error("Document update conflict: {0}")]
    Conflict(String),

    /// An all-or-nothing multi-document write was refused as a whole.
    #[error("Batch rejected: {0}")]
    Rejected(String),

    #[error("You are not authorized to access this database")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database already exists: {0}")]
    DatabaseExists(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed store response: {0}")]
    Decode(String),
}

/// All errors surfaced by couchtable.
#[derive(Debug, Error)]
pub enum TableError {
    /// Rejected before any store call; no partial state was created.
    #[error("{0}")]
    Validation(String),

    /// A table or document does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Part of a multi-record request did not resolve. `results` holds the
    /// per-item outcomes known when the batch stopped.
    #[error("Batch Error: {message}")]
    BatchPartialFailure {
        message: String,
        results: Vec<ItemResult>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store's id/revision model cannot express the request.
    #[error("{0}")]
    Unsupported(String),

    /// The operation failed, then reverting already-committed work failed too.
    #[error("{error} (rollback failed: {rollback})")]
    RollbackFailed {
        error: Box<TableError>,
        rollback: Box<TableError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TableError {
    /// Short machine-readable code, used in per-item error markers.
    pub fn code(&self) -> &'static str {
        match self {
            TableError::Validation(_) => "bad_request",
            TableError::NotFound(_) => "not_found",
            TableError::BatchPartialFailure { .. } => "batch_error",
            TableError::Store(StoreError::Conflict(_)) => "conflict",
            TableError::Store(StoreError::Rejected(_)) => "rejected",
            TableError::Store(StoreError::Unauthorized) => "unauthorized",
            TableError::Store(StoreError::Forbidden(_)) => "forbidden",
            TableError::Store(StoreError::DatabaseExists(_)) => "file_exists",
            TableError::Store(_) => "store_error",
            TableError::Unsupported(_) => "unsupported",
            TableError::RollbackFailed { .. } => "rollback_failed",
            TableError::Config(_) => "config_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TableError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, TableError::Store(StoreError::Conflict(_)))
    }

    pub fn filters_unsupported() -> Self {
        TableError::Unsupported("SQL-like filters are not currently available for CouchDB.".into())
    }
}

impl From<serde_json::Error> for TableError {
    fn from(err: serde_json::Error) -> Self {
        TableError::Store(StoreError::Decode(err.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, TableError>;

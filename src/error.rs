//! Error types for mnemos

use thiserror::Error;

/// Main error type for the memory system
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Store, embedding or extraction service unreachable or timed out
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Invariant violation on a node, edge or proposal item
    #[error("Validation error: {0}")]
    Validation(String),

    /// Memory not found
    #[error("Memory not found: {0}")]
    NotFound(String),

    /// Retry budget exceeded; wraps the last failure
    #[error("Retry budget exhausted for {operation} after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<MemoryError>,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MemoryError::Connectivity(_) => true,
            MemoryError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Connectivity loss, either directly or after the retry budget ran out on it.
    pub fn is_connectivity(&self) -> bool {
        match self {
            MemoryError::Exhausted { source, .. } => source.is_connectivity(),
            other => other.is_transient(),
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;

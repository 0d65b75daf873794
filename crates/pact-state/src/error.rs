//! Error types for pact-state

use thiserror::Error;

/// Errors that can occur in the state persistence layer.
///
/// Callers in the engine treat every variant as a soft failure: reads
/// degrade to "absent" and writes are dropped with a warning, so an
/// unavailable store never takes the agent down.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database connection error
    #[error("state backend connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("state backend query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("state schema setup failed: {0}")]
    SchemaSetup(String),

    /// A stored record could not be decoded
    #[error("corrupt record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Record is the wrong size for its fixed-width codec
    #[error("record size mismatch: expected {expected} bytes, got {actual}")]
    RecordSize { expected: usize, actual: usize },

    /// Backend I/O error
    #[error("state backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

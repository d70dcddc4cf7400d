//! Error types for q2p.

use thiserror::Error;

/// The main error type for q2p operations.
#[derive(Debug, Error)]
pub enum Q2PError {
    /// Candle tensor operation failed (includes shape mismatches)
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Query literal could not be tokenized or parsed
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    /// Query tree is structurally invalid: unknown tag or wrong arity
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// An entity, relation or label id is outside its table
    #[error("{kind} id {id} out of range (table has {limit} rows)")]
    IdOutOfRange {
        kind: &'static str,
        id: usize,
        limit: usize,
    },

    /// Nodes of one query (or query and labels) disagree on batch size
    #[error("batch size mismatch: expected {expected}, got {got}")]
    BatchMismatch { expected: usize, got: usize },

    /// Invalid construction parameters
    #[error("invalid config: {0}")]
    Config(String),

    /// Checkpoint does not match the model's parameter set
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for q2p operations.
pub type Result<T> = std::result::Result<T, Q2PError>;

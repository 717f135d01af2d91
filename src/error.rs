//! Error types for the historian

use crate::types::ConsumerToken;

/// Result type for historian operations
pub type HistorianResult<T> = Result<T, HistorianError>;

/// Errors that can occur inside the historian
///
/// Most of these never reach callers of the public ingestion and retrieval
/// API: those surfaces log and degrade to `None` / `false` instead.
#[derive(Debug, thiserror::Error)]
pub enum HistorianError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown consumer token: {0}")]
    UnknownToken(ConsumerToken),

    #[error("sequence number {0} is not in the stream")]
    SequenceNotFound(u64),

    #[error("materialized store error: {0}")]
    MaterializedStore(String),
}

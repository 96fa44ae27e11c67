use thiserror::Error;

/// Errors surfaced by a [`crate::store::SharedStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A watched key was written by someone else before the transaction ran.
    #[error("transaction aborted: watched key changed")]
    Conflict,

    #[error("wrong type for key {0}")]
    WrongType(String),

    #[error("invalid stored value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("serialization: {e}"))
    }
}

/// Errors returned to callers submitting events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("aggregator is shutting down")]
    ShuttingDown,
}

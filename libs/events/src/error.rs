//! Error types for event emission.

use thiserror::Error;

/// Errors that can occur when emitting events.
#[derive(Debug, Error)]
pub enum EventError {
    /// The event could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The sink could not be written to.
    #[error("sink write error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

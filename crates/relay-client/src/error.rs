//! Connector error type.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// No matching `response` frame arrived in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connector gave up reconnecting while a request was outstanding.
    #[error("Connector closed before a response arrived")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, ClientError>;

//! Error types for relay collaborators.

use thiserror::Error;

/// Result type alias using relay's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type returned by the Collection Service, Identity Resolver
/// and Authenticator boundaries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Record or collection not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication failed (missing, expired or invalid credentials)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Invalid input (bad query, bad key)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing or malformed payload for a write
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backing service failed
    #[error("Service error: {0}")]
    Service(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by the caller's permissions rather than the request.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Unauthorized(_) | Error::Forbidden(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

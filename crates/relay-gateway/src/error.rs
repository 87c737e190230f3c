//! Gateway error taxonomy.
//!
//! Upgrade and handshake failures end the connection. Everything else is
//! local to a single frame and is reported back as an `{error}` frame while
//! the connection stays open.

use thiserror::Error;

use crate::frame::FrameError;

/// Result type alias using the gateway's error type.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Strict-mode credential check failed before the upgrade completed.
    #[error("Upgrade rejected: {0}")]
    UpgradeRejected(String),

    /// Handshake-mode authentication failed after the upgrade.
    /// The reason is logged; the client only sees a generic message.
    #[error("Failed handshake.")]
    HandshakeFailed { reason: String },

    /// An inbound text frame could not be decoded.
    #[error(transparent)]
    FrameParse(#[from] FrameError),

    /// An ITEMS/GET/AUTH frame was structurally valid but unusable.
    #[error("{0}")]
    Operation(String),

    /// A collaborator call failed while serving a frame.
    #[error(transparent)]
    Collection(#[from] relay_core::Error),

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn operation(message: impl Into<String>) -> Self {
        GatewayError::Operation(message.into())
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        GatewayError::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// True for failures that end the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GatewayError::UpgradeRejected(_)
                | GatewayError::HandshakeFailed { .. }
                | GatewayError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_displays_bare_message() {
        let err = GatewayError::operation("invalid collection");
        assert_eq!(err.to_string(), "invalid collection");
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_handshake_hides_reason() {
        let err = GatewayError::handshake("token revoked");
        assert_eq!(err.to_string(), "Failed handshake.");
        assert!(err.is_terminal());
    }

    #[test]
    fn test_collection_error_is_transparent() {
        let err: GatewayError = relay_core::Error::Forbidden("articles".into()).into();
        assert_eq!(err.to_string(), "Forbidden: articles");
        assert!(!err.is_terminal());
    }
}

//! Inbound frame routing and the capability handler interface.
//!
//! Each open connection's text frames pass through [`MessageRouter::route`]
//! in arrival order. The router decodes the frame, refreshes the
//! connection's accountability, and offers the frame to every registered
//! [`SocketHandler`]. Failures are answered with an `{error}` frame and never
//! end the connection.
//!
//! [`FrameProtocol`] is the seam one level up: each upgrade endpoint mounts
//! one protocol, and the [`MessageRouter`] is the protocol of the
//! subscription endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::IdentityResolver;
use serde_json::Value as JsonValue;

use crate::auth::refresh_accountability;
use crate::connection::Connection;
use crate::error::{GatewayError, Result};
use crate::frame::{frame_uid, ClientFrame, FrameError, ServerFrame};

/// A capability plugged into the router.
///
/// All four hooks are optional; the defaults do nothing. `on_message` sees
/// every decoded frame and ignores the types it does not serve.
#[async_trait]
pub trait SocketHandler: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    async fn on_open(&self, _connection: &Arc<Connection>) {}

    async fn on_message(&self, _connection: &Arc<Connection>, _frame: &ClientFrame) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _connection: &Arc<Connection>) {}

    async fn on_close(&self, _connection: &Arc<Connection>) {}
}

/// Result of routing a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Offered to the handlers.
    Handled,
    /// Unknown or out-of-place frame type.
    Ignored,
    /// Decode or refresh failed; an error frame was sent.
    Rejected,
}

pub struct MessageRouter {
    handlers: Vec<Arc<dyn SocketHandler>>,
    identity: Arc<dyn IdentityResolver>,
}

impl MessageRouter {
    pub fn new(identity: Arc<dyn IdentityResolver>) -> Self {
        Self {
            handlers: Vec::new(),
            identity,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn SocketHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Route one text frame from `connection`.
    pub async fn route(&self, connection: &Arc<Connection>, text: &str) -> RouteOutcome {
        let value: JsonValue = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                return self.reject(connection, FrameError::Malformed(e.to_string()).into(), None)
            }
        };
        let uid = frame_uid(&value);
        let frame = match ClientFrame::from_value(value) {
            Ok(frame) => frame,
            Err(e) => return self.reject(connection, e.into(), uid),
        };

        tracing::trace!(
            connection_id = %connection.id(),
            frame_type = frame.type_name(),
            "Frame received"
        );

        match frame {
            ClientFrame::Ignored { ref frame_type } => {
                tracing::debug!(connection_id = %connection.id(), frame_type = %frame_type, "Ignoring unknown frame type");
                return RouteOutcome::Ignored;
            }
            ClientFrame::Handshake(_) => {
                tracing::debug!(connection_id = %connection.id(), "Ignoring HANDSHAKE on open connection");
                return RouteOutcome::Ignored;
            }
            ClientFrame::Auth(_) | ClientFrame::Ping { .. } => {}
            _ => {
                let current = connection.accountability();
                match refresh_accountability(self.identity.as_ref(), &current).await {
                    Ok(refreshed) => connection.set_accountability(refreshed),
                    Err(e) => return self.reject(connection, e, uid),
                }
            }
        }

        for handler in &self.handlers {
            if let Err(e) = handler.on_message(connection, &frame).await {
                tracing::debug!(
                    connection_id = %connection.id(),
                    handler = handler.name(),
                    frame_type = frame.type_name(),
                    error = %e,
                    "Handler failed"
                );
                connection.send(&ServerFrame::error(e.to_string(), uid.clone()));
            }
        }
        RouteOutcome::Handled
    }

    fn reject(&self, connection: &Connection, error: GatewayError, uid: Option<String>) -> RouteOutcome {
        tracing::debug!(connection_id = %connection.id(), error = %error, "Frame rejected");
        connection.send(&ServerFrame::error(error.to_string(), uid));
        RouteOutcome::Rejected
    }

    pub async fn open(&self, connection: &Arc<Connection>) {
        for handler in &self.handlers {
            handler.on_open(connection).await;
        }
    }

    pub async fn error(&self, connection: &Arc<Connection>) {
        for handler in &self.handlers {
            handler.on_error(connection).await;
        }
    }

    pub async fn close(&self, connection: &Arc<Connection>) {
        for handler in &self.handlers {
            handler.on_close(connection).await;
        }
    }
}

/// The wire protocol spoken on one upgrade endpoint.
///
/// The gateway owns upgrade, authentication and teardown for every endpoint
/// and hands each open connection's traffic to its protocol.
#[async_trait]
pub trait FrameProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// WebSocket subprotocols to select from the client's offer.
    fn subprotocols(&self) -> &'static [&'static str] {
        &[]
    }

    async fn on_open(&self, connection: &Arc<Connection>);

    async fn on_text(&self, connection: &Arc<Connection>, text: &str);

    async fn on_error(&self, connection: &Arc<Connection>);

    async fn on_close(&self, connection: &Arc<Connection>);
}

#[async_trait]
impl FrameProtocol for MessageRouter {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn on_open(&self, connection: &Arc<Connection>) {
        self.open(connection).await;
    }

    async fn on_text(&self, connection: &Arc<Connection>, text: &str) {
        self.route(connection, text).await;
    }

    async fn on_error(&self, connection: &Arc<Connection>) {
        self.error(connection).await;
    }

    async fn on_close(&self, connection: &Arc<Connection>) {
        self.close(connection).await;
    }
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::Result;
use crate::frame::{ClientFrame, ServerFrame};
use crate::router::SocketHandler;

/// Answers `PING` with `{type:'pong'}`.
#[derive(Debug, Default)]
pub struct HeartbeatHandler;

#[async_trait]
impl SocketHandler for HeartbeatHandler {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn on_message(&self, connection: &Arc<Connection>, frame: &ClientFrame) -> Result<()> {
        if let ClientFrame::Ping { .. } = frame {
            connection.send(&ServerFrame::Pong);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, Outbound};
    use relay_core::Accountability;

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (conn, mut rx) = Connection::new(Accountability::default());
        conn.transition(ConnectionState::Authenticating);
        conn.transition(ConnectionState::Open);

        HeartbeatHandler
            .on_message(&conn, &ClientFrame::Ping { uid: None })
            .await
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Text(r#"{"type":"pong"}"#.into())
        );

        HeartbeatHandler
            .on_message(&conn, &ClientFrame::Ignored { frame_type: "X".into() })
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}

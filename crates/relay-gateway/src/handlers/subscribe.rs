use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::Result;
use crate::frame::{ClientFrame, SubscribeFrame, UnsubscribeFrame};
use crate::registry::SubscriptionRegistry;
use crate::router::SocketHandler;

/// `SUBSCRIBE`/`UNSUBSCRIBE` frames and subscription cleanup on teardown.
///
/// Admission failures are silent: the client gets no frame and simply
/// receives no pushes.
pub struct SubscribeHandler {
    registry: Arc<SubscriptionRegistry>,
}

impl SubscribeHandler {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    async fn subscribe(&self, connection: &Arc<Connection>, frame: &SubscribeFrame) {
        self.registry
            .subscribe(
                &frame.collection,
                connection,
                frame.query.clone(),
                frame.uid.clone(),
            )
            .await;
    }

    fn unsubscribe(&self, connection: &Connection, frame: &UnsubscribeFrame) {
        let id = connection.id();
        let removed = match (&frame.uid, &frame.collection) {
            (Some(uid), _) => self.registry.unsubscribe_uid(id, uid),
            (None, Some(collection)) => self.registry.unsubscribe_collection(id, collection),
            (None, None) => self.registry.unsubscribe(id),
        };
        tracing::debug!(connection_id = %id, removed, "Unsubscribed");
    }
}

#[async_trait]
impl SocketHandler for SubscribeHandler {
    fn name(&self) -> &'static str {
        "subscribe"
    }

    async fn on_message(&self, connection: &Arc<Connection>, frame: &ClientFrame) -> Result<()> {
        match frame {
            ClientFrame::Subscribe(sub) => self.subscribe(connection, sub).await,
            ClientFrame::Unsubscribe(unsub) => self.unsubscribe(connection, unsub),
            _ => {}
        }
        Ok(())
    }

    async fn on_error(&self, connection: &Arc<Connection>) {
        self.registry.unsubscribe(connection.id());
    }

    async fn on_close(&self, connection: &Arc<Connection>) {
        self.registry.unsubscribe(connection.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use relay_core::mock::{Access, MockCollectionService};
    use relay_core::Accountability;

    fn setup() -> (Arc<SubscriptionRegistry>, SubscribeHandler, Arc<Connection>) {
        let store = MockCollectionService::new()
            .with_grant(Some("editor"), "articles", Access::Read)
            .with_grant(Some("editor"), "comments", Access::Read);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(store)));
        let handler = SubscribeHandler::new(registry.clone());
        let (conn, _rx) = Connection::new(Accountability {
            role: Some("editor".into()),
            ..Default::default()
        });
        conn.transition(ConnectionState::Authenticating);
        conn.transition(ConnectionState::Open);
        (registry, handler, conn)
    }

    async fn send(handler: &SubscribeHandler, conn: &Arc<Connection>, text: &str) {
        handler
            .on_message(conn, &ClientFrame::decode(text).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_variants() {
        let (registry, handler, conn) = setup();
        send(&handler, &conn, r#"{"type":"SUBSCRIBE","collection":"articles","uid":"a"}"#).await;
        send(&handler, &conn, r#"{"type":"SUBSCRIBE","collection":"articles","uid":"b"}"#).await;
        send(&handler, &conn, r#"{"type":"SUBSCRIBE","collection":"comments"}"#).await;
        send(&handler, &conn, r#"{"type":"SUBSCRIBE","collection":"secrets"}"#).await;
        assert_eq!(registry.count_for(conn.id()), 3);

        send(&handler, &conn, r#"{"type":"UNSUBSCRIBE","uid":"a"}"#).await;
        assert_eq!(registry.count_for(conn.id()), 2);

        send(&handler, &conn, r#"{"type":"UNSUBSCRIBE","collection":"comments"}"#).await;
        assert_eq!(registry.count_for(conn.id()), 1);

        send(&handler, &conn, r#"{"type":"UNSUBSCRIBE"}"#).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_and_error_purge() {
        let (registry, handler, conn) = setup();
        send(&handler, &conn, r#"{"type":"SUBSCRIBE","collection":"articles"}"#).await;

        handler.on_error(&conn).await;
        assert!(registry.is_empty());
        handler.on_close(&conn).await;
        assert!(registry.is_empty());
    }
}

//! Schema endpoint: the `graphql-transport-ws` protocol over a
//! [`SchemaService`].
//!
//! ```text
//! client                          server
//!   connection_init {payload} ──►   resolve payload.token
//!                             ◄──   connection_ack
//!   subscribe {id, payload}   ──►   SchemaService::execute
//!                             ◄──   next {id, payload} (one per result)
//!                             ◄──   complete {id}
//!   complete {id}             ──►   cancel the operation
//! ```
//!
//! Protocol violations close the socket with the protocol's status codes.
//! Credentials ride in the `connection_init` payload, so a public endpoint
//! still runs operations as the resolved user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use relay_core::{Accountability, IdentityResolver, SchemaRequest, SchemaService};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::refresh_accountability;
use crate::connection::Connection;
use crate::router::FrameProtocol;

/// Subprotocol name negotiated during the upgrade.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// Close codes defined by the protocol.
pub mod close_code {
    pub const BAD_REQUEST: u16 = 4400;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const FORBIDDEN: u16 = 4403;
    pub const INIT_TIMEOUT: u16 = 4408;
    pub const SUBSCRIBER_EXISTS: u16 = 4409;
    pub const TOO_MANY_INITS: u16 = 4429;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<JsonValue>,
    },
    Ping {
        #[serde(default)]
        #[allow(dead_code)]
        payload: Option<JsonValue>,
    },
    Pong {
        #[serde(default)]
        #[allow(dead_code)]
        payload: Option<JsonValue>,
    },
    Subscribe {
        id: String,
        payload: SchemaRequest,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum ServerMessage {
    ConnectionAck,
    Pong,
    Next { id: String, payload: JsonValue },
    Error { id: String, message: String },
    Complete { id: String },
}

impl ServerMessage {
    fn to_text(&self) -> String {
        let value = match self {
            ServerMessage::ConnectionAck => json!({ "type": "connection_ack" }),
            ServerMessage::Pong => json!({ "type": "pong" }),
            ServerMessage::Next { id, payload } => {
                json!({ "type": "next", "id": id, "payload": payload })
            }
            ServerMessage::Error { id, message } => {
                json!({ "type": "error", "id": id, "payload": [{ "message": message }] })
            }
            ServerMessage::Complete { id } => json!({ "type": "complete", "id": id }),
        };
        value.to_string()
    }
}

#[derive(Default)]
struct Session {
    initialised: bool,
    acknowledged: bool,
    init_timer: Option<JoinHandle<()>>,
    operations: HashMap<String, JoinHandle<()>>,
}

impl Session {
    fn cancel_all(&mut self) {
        if let Some(timer) = self.init_timer.take() {
            timer.abort();
        }
        for (_, task) in self.operations.drain() {
            task.abort();
        }
    }
}

type Sessions = Arc<Mutex<HashMap<Uuid, Session>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bearer token carried in a `connection_init` payload.
fn init_token(payload: Option<&JsonValue>) -> Option<String> {
    let payload = payload?;
    ["token", "access_token"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(JsonValue::as_str))
        .map(String::from)
}

pub struct SchemaProtocol {
    schema: Arc<dyn SchemaService>,
    identity: Arc<dyn IdentityResolver>,
    init_timeout: Duration,
    sessions: Sessions,
}

impl SchemaProtocol {
    pub fn new(
        schema: Arc<dyn SchemaService>,
        identity: Arc<dyn IdentityResolver>,
        init_timeout: Duration,
    ) -> Self {
        Self {
            schema,
            identity,
            init_timeout,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Operations currently running for `connection`.
    pub fn running(&self, connection: &Connection) -> usize {
        lock(&self.sessions)
            .get(&connection.id())
            .map(|s| s.operations.len())
            .unwrap_or(0)
    }

    async fn init(&self, connection: &Arc<Connection>, payload: Option<JsonValue>) {
        {
            let mut sessions = lock(&self.sessions);
            let Some(session) = sessions.get_mut(&connection.id()) else {
                return;
            };
            if session.initialised {
                drop(sessions);
                connection.close_with(close_code::TOO_MANY_INITS, "Too many initialisation requests");
                return;
            }
            session.initialised = true;
            if let Some(timer) = session.init_timer.take() {
                timer.abort();
            }
        }

        if let Some(token) = init_token(payload.as_ref()) {
            match self.identity.accountability_for_token(Some(&token)).await {
                Ok(resolved) => {
                    let current = connection.accountability();
                    connection.set_accountability(
                        resolved.with_origin(current.ip.clone(), current.user_agent.clone()),
                    );
                }
                Err(e) => {
                    tracing::warn!(connection_id = %connection.id(), error = %e, "connection_init rejected");
                    connection.close_with(close_code::FORBIDDEN, "Forbidden");
                    return;
                }
            }
        }

        if let Some(session) = lock(&self.sessions).get_mut(&connection.id()) {
            session.acknowledged = true;
        }
        let accountability = connection.accountability();
        tracing::debug!(
            connection_id = %connection.id(),
            user = accountability.label(),
            "Schema connection acknowledged"
        );
        connection.send_text(ServerMessage::ConnectionAck.to_text());
    }

    async fn subscribe(&self, connection: &Arc<Connection>, id: String, request: SchemaRequest) {
        let acknowledged = lock(&self.sessions)
            .get(&connection.id())
            .is_some_and(|s| s.acknowledged);
        if !acknowledged {
            connection.close_with(close_code::UNAUTHORIZED, "Unauthorized");
            return;
        }

        let current = connection.accountability();
        let accountability = match refresh_accountability(self.identity.as_ref(), &current).await {
            Ok(refreshed) => {
                connection.set_accountability(refreshed.clone());
                refreshed
            }
            Err(e) => {
                connection.send_text(
                    ServerMessage::Error {
                        id,
                        message: e.to_string(),
                    }
                    .to_text(),
                );
                return;
            }
        };

        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.get_mut(&connection.id()) else {
            return;
        };
        if session.operations.contains_key(&id) {
            drop(sessions);
            connection.close_with(
                close_code::SUBSCRIBER_EXISTS,
                format!("Subscriber for {} already exists", id),
            );
            return;
        }
        tracing::debug!(
            connection_id = %connection.id(),
            operation_id = %id,
            operation_name = request.operation_name.as_deref().unwrap_or(""),
            "Operation started"
        );
        // Spawned under the lock so the task cannot finish before it is tracked.
        let task = tokio::spawn(run_operation(
            self.schema.clone(),
            self.sessions.clone(),
            connection.clone(),
            id.clone(),
            request,
            accountability,
        ));
        session.operations.insert(id, task);
    }

    fn complete(&self, connection: &Connection, id: &str) {
        let task = lock(&self.sessions)
            .get_mut(&connection.id())
            .and_then(|s| s.operations.remove(id));
        if let Some(task) = task {
            task.abort();
            tracing::debug!(connection_id = %connection.id(), operation_id = %id, "Operation cancelled");
        }
    }
}

async fn run_operation(
    schema: Arc<dyn SchemaService>,
    sessions: Sessions,
    connection: Arc<Connection>,
    id: String,
    request: SchemaRequest,
    accountability: Accountability,
) {
    let last = match schema.execute(request, &accountability).await {
        Ok(mut results) => {
            while let Some(result) = results.next().await {
                let next = ServerMessage::Next {
                    id: id.clone(),
                    payload: result,
                };
                if !connection.send_text(next.to_text()) {
                    break;
                }
            }
            ServerMessage::Complete { id: id.clone() }
        }
        Err(e) => ServerMessage::Error {
            id: id.clone(),
            message: e.to_string(),
        },
    };
    // Untrack first: the client may reuse the id as soon as it sees `complete`.
    if let Some(session) = lock(&sessions).get_mut(&connection.id()) {
        session.operations.remove(&id);
    }
    connection.send_text(last.to_text());
}

#[async_trait]
impl FrameProtocol for SchemaProtocol {
    fn name(&self) -> &'static str {
        "graphql"
    }

    fn subprotocols(&self) -> &'static [&'static str] {
        &[SUBPROTOCOL]
    }

    async fn on_open(&self, connection: &Arc<Connection>) {
        let sessions = self.sessions.clone();
        let timeout = self.init_timeout;
        let conn = connection.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let waiting = lock(&sessions)
                .get(&conn.id())
                .is_some_and(|s| !s.initialised);
            if waiting {
                tracing::warn!(connection_id = %conn.id(), "connection_init not received in time");
                conn.close_with(close_code::INIT_TIMEOUT, "Connection initialisation timeout");
            }
        });
        lock(&self.sessions).insert(
            connection.id(),
            Session {
                init_timer: Some(timer),
                ..Default::default()
            },
        );
    }

    async fn on_text(&self, connection: &Arc<Connection>, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection_id = %connection.id(), error = %e, "Invalid schema message");
                connection.close_with(close_code::BAD_REQUEST, "Invalid message received");
                return;
            }
        };
        match message {
            ClientMessage::ConnectionInit { payload } => self.init(connection, payload).await,
            ClientMessage::Ping { .. } => {
                connection.send_text(ServerMessage::Pong.to_text());
            }
            ClientMessage::Pong { .. } => {}
            ClientMessage::Subscribe { id, payload } => self.subscribe(connection, id, payload).await,
            ClientMessage::Complete { id } => self.complete(connection, &id),
        }
    }

    async fn on_error(&self, _connection: &Arc<Connection>) {}

    async fn on_close(&self, connection: &Arc<Connection>) {
        if let Some(mut session) = lock(&self.sessions).remove(&connection.id()) {
            session.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, Outbound};
    use relay_core::mock::{Access, MockCollectionService, MockIdentityResolver, MockSchemaService};
    use relay_core::{MutationBus, MutationEvent, PrimaryKey};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        protocol: SchemaProtocol,
        schema: MockSchemaService,
        store: MockCollectionService,
        bus: Arc<MutationBus>,
    }

    fn harness(init_timeout: Duration) -> Harness {
        let bus = Arc::new(MutationBus::new(16));
        let store = MockCollectionService::new()
            .with_bus(bus.clone())
            .with_grant(Some("editor"), "articles", Access::ReadWrite);
        let identity = MockIdentityResolver::new()
            .with_role("editor", false)
            .with_token("tok-1", "ada", Some("editor"));
        let schema = MockSchemaService::new(store.clone());
        Harness {
            protocol: SchemaProtocol::new(Arc::new(schema.clone()), Arc::new(identity), init_timeout),
            schema,
            store,
            bus,
        }
    }

    async fn open(h: &Harness) -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        let (conn, rx) = Connection::new(Accountability::anonymous(Some("10.0.0.1".into()), None));
        conn.transition(ConnectionState::Authenticating);
        conn.transition(ConnectionState::Open);
        h.protocol.on_open(&conn).await;
        (conn, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("writer closed")
    }

    async fn next_json(rx: &mut UnboundedReceiver<Outbound>) -> JsonValue {
        match next(rx).await {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text, got {:?}", other),
        }
    }

    async fn acknowledged(h: &Harness) -> (Arc<Connection>, UnboundedReceiver<Outbound>) {
        let (conn, mut rx) = open(h).await;
        h.protocol
            .on_text(&conn, r#"{"type":"connection_init","payload":{"token":"tok-1"}}"#)
            .await;
        assert_eq!(next_json(&mut rx).await, json!({"type": "connection_ack"}));
        (conn, rx)
    }

    #[test]
    fn test_init_token_keys() {
        assert_eq!(init_token(Some(&json!({"token": "a"}))), Some("a".into()));
        assert_eq!(init_token(Some(&json!({"access_token": "b"}))), Some("b".into()));
        assert_eq!(init_token(Some(&json!({"token": 1}))), None);
        assert_eq!(init_token(None), None);
    }

    #[tokio::test]
    async fn test_init_resolves_token_and_keeps_origin() {
        let h = harness(Duration::from_secs(5));
        let (conn, _rx) = acknowledged(&h).await;
        let accountability = conn.accountability();
        assert_eq!(accountability.user.as_deref(), Some("ada"));
        assert_eq!(accountability.ip.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_init_without_token_stays_anonymous() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = open(&h).await;
        h.protocol.on_text(&conn, r#"{"type":"connection_init"}"#).await;
        assert_eq!(next_json(&mut rx).await, json!({"type": "connection_ack"}));
        assert!(conn.accountability().user.is_none());
    }

    #[tokio::test]
    async fn test_bad_token_closes_forbidden() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = open(&h).await;
        h.protocol
            .on_text(&conn, r#"{"type":"connection_init","payload":{"token":"nope"}}"#)
            .await;
        assert_eq!(
            next(&mut rx).await,
            Outbound::CloseWith(close_code::FORBIDDEN, "Forbidden".into())
        );
    }

    #[tokio::test]
    async fn test_second_init_closes() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = acknowledged(&h).await;
        h.protocol.on_text(&conn, r#"{"type":"connection_init"}"#).await;
        assert!(matches!(
            next(&mut rx).await,
            Outbound::CloseWith(close_code::TOO_MANY_INITS, _)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_before_ack_closes_unauthorized() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = open(&h).await;
        h.protocol
            .on_text(&conn, r#"{"type":"subscribe","id":"1","payload":{"query":"{ articles }"}}"#)
            .await;
        assert_eq!(
            next(&mut rx).await,
            Outbound::CloseWith(close_code::UNAUTHORIZED, "Unauthorized".into())
        );
        assert!(h.schema.executions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_message_closes_bad_request() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = open(&h).await;
        h.protocol.on_text(&conn, r#"{"type":"start","id":"1"}"#).await;
        assert!(matches!(
            next(&mut rx).await,
            Outbound::CloseWith(close_code::BAD_REQUEST, _)
        ));
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = open(&h).await;
        h.protocol.on_text(&conn, r#"{"type":"ping"}"#).await;
        assert_eq!(next_json(&mut rx).await, json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn test_query_yields_next_then_complete() {
        let h = harness(Duration::from_secs(5));
        h.store.seed("articles", vec![json!({"id": 1})]);
        let (conn, mut rx) = acknowledged(&h).await;

        h.protocol
            .on_text(
                &conn,
                r#"{"type":"subscribe","id":"q1","payload":{"query":"{ articles }","operationName":"Feed"}}"#,
            )
            .await;
        assert_eq!(
            next_json(&mut rx).await,
            json!({"type": "next", "id": "q1", "payload": {"data": {"articles": [{"id": 1}]}}})
        );
        assert_eq!(next_json(&mut rx).await, json!({"type": "complete", "id": "q1"}));
        assert_eq!(
            h.schema.executions(),
            vec![("{ articles }".to_string(), Some("ada".to_string()))]
        );
        assert_eq!(h.protocol.running(&conn), 0);
    }

    #[tokio::test]
    async fn test_failed_execution_sends_error() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = acknowledged(&h).await;
        h.protocol
            .on_text(&conn, r#"{"type":"subscribe","id":"m1","payload":{"query":"mutation"}}"#)
            .await;
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["id"], "m1");
        assert!(frame["payload"][0]["message"].as_str().is_some());
        assert_eq!(h.protocol.running(&conn), 0);
    }

    #[tokio::test]
    async fn test_subscription_streams_until_complete() {
        let h = harness(Duration::from_secs(5));
        let (conn, mut rx) = acknowledged(&h).await;
        h.protocol
            .on_text(
                &conn,
                r#"{"type":"subscribe","id":"s1","payload":{"query":"subscription { articles_mutated }"}}"#,
            )
            .await;
        while h.bus.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        h.bus.emit(MutationEvent::created("articles", vec![PrimaryKey::Int(4)]));
        assert_eq!(
            next_json(&mut rx).await,
            json!({"type": "next", "id": "s1", "payload": {"data": {"articles_mutated": {"event": "create", "keys": [4]}}}})
        );

        // Same id while running.
        h.protocol
            .on_text(
                &conn,
                r#"{"type":"subscribe","id":"s1","payload":{"query":"{ articles }"}}"#,
            )
            .await;
        assert!(matches!(
            next(&mut rx).await,
            Outbound::CloseWith(close_code::SUBSCRIBER_EXISTS, _)
        ));

        h.protocol.on_text(&conn, r#"{"type":"complete","id":"s1"}"#).await;
        assert_eq!(h.protocol.running(&conn), 0);
        h.bus.emit(MutationEvent::created("articles", vec![PrimaryKey::Int(5)]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_cancels_operations() {
        let h = harness(Duration::from_secs(5));
        let (conn, _rx) = acknowledged(&h).await;
        h.protocol
            .on_text(
                &conn,
                r#"{"type":"subscribe","id":"s1","payload":{"query":"subscription { articles_mutated }"}}"#,
            )
            .await;
        assert_eq!(h.protocol.running(&conn), 1);

        h.protocol.on_close(&conn).await;
        assert_eq!(h.protocol.running(&conn), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_init_times_out() {
        let h = harness(Duration::from_secs(3));
        let (_conn, mut rx) = open(&h).await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::CloseWith(close_code::INIT_TIMEOUT, _))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_in_time_cancels_timer() {
        let h = harness(Duration::from_secs(3));
        let (conn, mut rx) = open(&h).await;
        h.protocol.on_text(&conn, r#"{"type":"connection_init"}"#).await;
        assert_eq!(next_json(&mut rx).await, json!({"type": "connection_ack"}));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());
    }
}

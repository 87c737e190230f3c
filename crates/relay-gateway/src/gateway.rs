//! Connection gateway: upgrade endpoint, authentication state machine and
//! the set of live connections.
//!
//! # Lifecycle
//!
//! 1. The upgrade request creates a `Pending` [`Connection`]. In strict mode
//!    the bearer token is resolved here and a failure answers `401` without
//!    upgrading.
//! 2. After the upgrade the connection is `Authenticating`. In handshake mode
//!    the first frame must be a `HANDSHAKE` arriving within the timeout.
//! 3. `Open`: the connection is registered, a [`GatewayEvent::Connected`] is
//!    published and the [`MessageRouter`] takes over inbound traffic.
//! 4. `Closed`: on transport close or error the connection is removed, the
//!    handlers' error/close hooks run (purging subscriptions) and the
//!    matching events are published.
//!
//! # Endpoints
//!
//! The subscription endpoint mounts the [`MessageRouter`]. When a
//! [`SchemaService`] is installed, a second endpoint mounts the
//! [`SchemaProtocol`]. Both share the connection set, the lifecycle events
//! and the steps above; each has its own path and auth mode.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query as QueryParams, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use relay_core::{
    Accountability, Authenticator, CollectionService, HeartbeatConfig, IdentityResolver,
    MutationBus, SchemaService,
};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{extract_token, resolve_credentials, Credentials};
use crate::config::{AuthMode, GatewayConfig};
use crate::connection::{Connection, ConnectionState, Outbound};
use crate::dispatcher::EventDispatcher;
use crate::error::{GatewayError, Result};
use crate::frame::{ClientFrame, ServerFrame};
use crate::handlers::{AuthHandler, HeartbeatHandler, ItemsHandler, SubscribeHandler};
use crate::registry::SubscriptionRegistry;
use crate::router::{FrameProtocol, MessageRouter, SocketHandler};
use crate::schema::SchemaProtocol;

/// Connection lifecycle notifications.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Connected {
        connection_id: Uuid,
        accountability: Accountability,
    },
    Error {
        connection_id: Uuid,
        error: String,
    },
    Closed {
        connection_id: Uuid,
    },
}

/// Restricts a broadcast to connections of one user and/or role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastFilter {
    pub user: Option<String>,
    pub role: Option<String>,
}

impl BroadcastFilter {
    fn admits(&self, accountability: &Accountability) -> bool {
        if self.user.is_some() && self.user != accountability.user {
            return false;
        }
        if self.role.is_some() && self.role != accountability.role {
            return false;
        }
        true
    }
}

/// One mounted upgrade path.
struct Endpoint {
    path: String,
    auth: AuthMode,
    protocol: Arc<dyn FrameProtocol>,
}

#[derive(Clone)]
struct EndpointState {
    gateway: Arc<Gateway>,
    endpoint: Arc<Endpoint>,
}

/// Builder for a [`Gateway`].
///
/// The auth, items and subscribe handlers are always installed; the
/// heartbeat handler follows `config.heartbeat_enabled`. Extra handlers run
/// after the built-in ones. The schema endpoint is mounted only when a
/// schema is installed and `config.graphql.enabled` is set.
pub struct GatewayBuilder {
    config: GatewayConfig,
    collections: Arc<dyn CollectionService>,
    identity: Arc<dyn IdentityResolver>,
    authenticator: Arc<dyn Authenticator>,
    extra_handlers: Vec<Arc<dyn SocketHandler>>,
    schema: Option<Arc<dyn SchemaService>>,
}

impl GatewayBuilder {
    pub fn new(
        config: GatewayConfig,
        collections: Arc<dyn CollectionService>,
        identity: Arc<dyn IdentityResolver>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            collections,
            identity,
            authenticator,
            extra_handlers: Vec::new(),
            schema: None,
        }
    }

    /// Install the schema served on the schema endpoint.
    pub fn with_schema(mut self, schema: Arc<dyn SchemaService>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Register an additional capability handler.
    pub fn with_handler(mut self, handler: Arc<dyn SocketHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    pub fn build(self) -> Arc<Gateway> {
        let registry = Arc::new(SubscriptionRegistry::new(self.collections.clone()));

        let mut router = MessageRouter::new(self.identity.clone()).with_handler(Arc::new(
            AuthHandler::new(self.identity.clone(), self.authenticator.clone()),
        ));
        if self.config.heartbeat_enabled {
            router = router.with_handler(Arc::new(HeartbeatHandler));
        }
        router = router
            .with_handler(Arc::new(ItemsHandler::new(self.collections.clone())))
            .with_handler(Arc::new(SubscribeHandler::new(registry.clone())));
        for handler in self.extra_handlers {
            router = router.with_handler(handler);
        }

        let router = Arc::new(router);

        let mut endpoints = Vec::new();
        if self.config.enabled {
            endpoints.push(Arc::new(Endpoint {
                path: self.config.path.clone(),
                auth: self.config.auth,
                protocol: router.clone(),
            }));
        }
        let graphql = &self.config.graphql;
        match (&self.schema, graphql.enabled) {
            (Some(schema), true) => endpoints.push(Arc::new(Endpoint {
                path: graphql.path.clone(),
                auth: graphql.auth(),
                protocol: Arc::new(SchemaProtocol::new(
                    schema.clone(),
                    self.identity.clone(),
                    graphql.init_timeout,
                )),
            })),
            (None, true) => tracing::debug!("No schema installed, schema endpoint not mounted"),
            (_, false) => {}
        }

        let (events, _) = broadcast::channel(relay_core::defaults::GATEWAY_EVENT_CAPACITY);

        tracing::info!(
            path = %self.config.path,
            auth_mode = %self.config.auth,
            handlers = ?router.handler_names(),
            endpoints = ?endpoints.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            "Gateway built"
        );

        Arc::new(Gateway {
            config: self.config,
            collections: self.collections,
            identity: self.identity,
            authenticator: self.authenticator,
            registry,
            router,
            endpoints,
            connections: RwLock::new(HashMap::new()),
            events,
        })
    }
}

pub struct Gateway {
    config: GatewayConfig,
    collections: Arc<dyn CollectionService>,
    identity: Arc<dyn IdentityResolver>,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<SubscriptionRegistry>,
    router: Arc<MessageRouter>,
    endpoints: Vec<Arc<Endpoint>>,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl Gateway {
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Protocol of the subscription endpoint.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Start fanning mutations from `bus` out to subscribers.
    pub fn spawn_dispatcher(&self, bus: &MutationBus) -> JoinHandle<()> {
        Arc::new(EventDispatcher::new(
            self.registry.clone(),
            self.collections.clone(),
            self.identity.clone(),
        ))
        .spawn(bus)
    }

    /// Paths of the mounted upgrade endpoints.
    pub fn endpoint_paths(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.path.as_str()).collect()
    }

    /// Axum router serving every mounted endpoint. Empty when none is.
    pub fn routes(self: &Arc<Self>) -> Router {
        if !self.config.enabled {
            tracing::info!("Subscription endpoint disabled");
        }
        self.endpoints.iter().fold(Router::new(), |router, endpoint| {
            let state = EndpointState {
                gateway: self.clone(),
                endpoint: endpoint.clone(),
            };
            router.merge(
                Router::new()
                    .route(&endpoint.path, get(upgrade_handler))
                    .with_state(state),
            )
        })
    }

    /// Open connections, in no particular order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Send `message` to every open connection admitted by `filter`.
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, message: &JsonValue, filter: &BroadcastFilter) -> usize {
        let text = message.to_string();
        self.connections()
            .iter()
            .filter(|c| filter.admits(&c.accountability()))
            .filter(|c| c.send_text(text.clone()))
            .count()
    }

    /// Close every open connection.
    pub fn terminate(&self) {
        let connections = self.connections();
        tracing::info!(count = connections.len(), "Terminating connections");
        for connection in connections {
            connection.close();
        }
    }

    fn publish(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    /// Strict-mode check, run before the upgrade completes.
    async fn authorize_upgrade(&self, token: Option<String>) -> Result<Accountability> {
        let token = token.ok_or_else(|| GatewayError::UpgradeRejected("missing token".into()))?;
        let accountability = self
            .identity
            .accountability_for_token(Some(&token))
            .await
            .map_err(|e| GatewayError::UpgradeRejected(e.to_string()))?;
        if accountability.user.is_none() {
            return Err(GatewayError::UpgradeRejected("token has no user".into()));
        }
        Ok(accountability)
    }

    /// Wait for the `HANDSHAKE` frame and resolve its credentials.
    async fn handshake(&self, socket: &mut WebSocket, timeout: Duration) -> Result<Accountability> {
        let text = tokio::time::timeout(timeout, first_text(socket))
            .await
            .map_err(|_| GatewayError::handshake("timed out"))??;

        let frame = ClientFrame::decode(&text).map_err(|e| GatewayError::handshake(e.to_string()))?;
        let ClientFrame::Handshake(handshake) = frame else {
            return Err(GatewayError::handshake(format!(
                "expected HANDSHAKE, got {}",
                frame.type_name()
            )));
        };
        let credentials = Credentials::from_handshake(&handshake)
            .ok_or_else(|| GatewayError::handshake("missing credentials"))?;
        resolve_credentials(
            &credentials,
            self.identity.as_ref(),
            self.authenticator.as_ref(),
        )
        .await
        .map_err(|e| GatewayError::handshake(e.to_string()))
    }

    /// Drive an upgraded socket until it closes.
    async fn serve(
        self: Arc<Self>,
        endpoint: Arc<Endpoint>,
        mut socket: WebSocket,
        connection: Arc<Connection>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let id = connection.id();
        connection.transition(ConnectionState::Authenticating);

        if let AuthMode::Handshake { timeout } = endpoint.auth {
            match self.handshake(&mut socket, timeout).await {
                Ok(accountability) => {
                    let current = connection.accountability();
                    connection.set_accountability(
                        accountability.with_origin(current.ip.clone(), current.user_agent.clone()),
                    );
                }
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = ?e, "Handshake failed");
                    let _ = socket
                        .send(Message::Text(ServerFrame::error(e.to_string(), None).to_text()))
                        .await;
                    let _ = socket.close().await;
                    connection.transition(ConnectionState::Closed);
                    return;
                }
            }
        }

        connection.transition(ConnectionState::Open);
        let accountability = connection.accountability();
        let active = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.insert(id, connection.clone());
            connections.len()
        };
        tracing::info!(
            connection_id = %id,
            path = %endpoint.path,
            protocol = endpoint.protocol.name(),
            user = accountability.label(),
            active,
            "Connection opened"
        );
        self.publish(GatewayEvent::Connected {
            connection_id: id,
            accountability: (*accountability).clone(),
        });
        endpoint.protocol.on_open(&connection).await;

        let (sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(write_loop(sink, outbound, id));
        let idle = self
            .config
            .idle_check
            .map(|check| tokio::spawn(idle_loop(connection.clone(), check)));

        let transport_error = tokio::select! {
            result = read_loop(endpoint.protocol.as_ref(), &connection, &mut stream) => result,
            _ = &mut writer => None,
        };

        writer.abort();
        if let Some(idle) = idle {
            idle.abort();
        }

        connection.mark_closed();
        let active = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.remove(&id);
            connections.len()
        };

        if let Some(error) = transport_error {
            tracing::warn!(connection_id = %id, error = %error, "Connection error");
            endpoint.protocol.on_error(&connection).await;
            self.publish(GatewayEvent::Error {
                connection_id: id,
                error,
            });
        }
        endpoint.protocol.on_close(&connection).await;
        self.publish(GatewayEvent::Closed { connection_id: id });
        tracing::info!(connection_id = %id, active, "Connection closed");
    }

}

/// Hand inbound frames to `protocol` until the peer closes. Returns the
/// transport error, if that is what ended the stream.
async fn read_loop(
    protocol: &dyn FrameProtocol,
    connection: &Arc<Connection>,
    stream: &mut SplitStream<WebSocket>,
) -> Option<String> {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => return Some(e.to_string()),
        };
        connection.liveness().touch();
        match message {
            Message::Text(text) => protocol.on_text(connection, &text).await,
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!(connection_id = %connection.id(), "Ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    None
}

/// Next text frame, skipping control frames.
async fn first_text(socket: &mut WebSocket) -> Result<String> {
    while let Some(message) = socket.recv().await {
        match message.map_err(|e| GatewayError::Transport(e.to_string()))? {
            Message::Text(text) => return Ok(text),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => return Err(GatewayError::handshake("binary frame")),
            Message::Close(_) => break,
        }
    }
    Err(GatewayError::handshake("closed before handshake"))
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    id: Uuid,
) {
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Text(text) => sink.send(Message::Text(text)).await,
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Outbound::CloseWith(code, reason) => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if let Err(e) = result {
            tracing::debug!(connection_id = %id, error = %e, "Write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Idle check: ping every interval, close if nothing at all comes back.
async fn idle_loop(connection: Arc<Connection>, check: HeartbeatConfig) {
    loop {
        tokio::time::sleep(check.interval).await;
        let mark = connection.liveness().seen();
        if !connection.ping() {
            break;
        }
        if !connection
            .liveness()
            .wait_for_traffic(mark, check.timeout)
            .await
        {
            tracing::warn!(connection_id = %connection.id(), "Idle check timed out, closing");
            connection.close();
            break;
        }
    }
}

async fn upgrade_handler(
    State(EndpointState { gateway, endpoint }): State<EndpointState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    QueryParams(params): QueryParams<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let accountability = match endpoint.auth {
        AuthMode::Strict => {
            match gateway
                .authorize_upgrade(extract_token(&params, &headers))
                .await
            {
                Ok(acc) => acc.with_origin(ip, user_agent),
                Err(e) => {
                    let (connection, _) =
                        Connection::new(Accountability::anonymous(ip, user_agent));
                    connection.transition(ConnectionState::Rejected);
                    tracing::warn!(
                        connection_id = %connection.id(),
                        path = %endpoint.path,
                        auth_mode = "strict",
                        error = %e,
                        "Upgrade rejected"
                    );
                    return (
                        StatusCode::UNAUTHORIZED,
                        [(header::CONNECTION, "close")],
                        "Unauthorized",
                    )
                        .into_response();
                }
            }
        }
        AuthMode::Public | AuthMode::Handshake { .. } => Accountability::anonymous(ip, user_agent),
    };

    let (connection, outbound) = Connection::new(accountability);
    tracing::debug!(
        connection_id = %connection.id(),
        path = %endpoint.path,
        auth_mode = %endpoint.auth,
        "Upgrading connection"
    );
    ws.protocols(endpoint.protocol.subprotocols().iter().copied())
        .on_upgrade(move |socket| gateway.serve(endpoint, socket, connection, outbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::mock::{
        MockAuthenticator, MockCollectionService, MockIdentityResolver, MockSchemaService,
    };
    use serde_json::json;

    fn gateway(config: GatewayConfig) -> Arc<Gateway> {
        let identity = MockIdentityResolver::new()
            .with_role("editor", false)
            .with_token("tok-1", "user-1", Some("editor"))
            .with_token("tok-2", "user-2", None);
        GatewayBuilder::new(
            config,
            Arc::new(MockCollectionService::new()),
            Arc::new(identity),
            Arc::new(MockAuthenticator::new()),
        )
        .build()
    }

    fn register(gw: &Gateway, acc: Accountability) -> mpsc::UnboundedReceiver<Outbound> {
        let (conn, rx) = Connection::new(acc);
        conn.transition(ConnectionState::Authenticating);
        conn.transition(ConnectionState::Open);
        gw.connections
            .write()
            .unwrap()
            .insert(conn.id(), conn.clone());
        rx
    }

    #[test]
    fn test_broadcast_filter() {
        let filter = BroadcastFilter {
            user: None,
            role: Some("editor".into()),
        };
        assert!(filter.admits(&Accountability {
            role: Some("editor".into()),
            ..Default::default()
        }));
        assert!(!filter.admits(&Accountability::default()));
        assert!(BroadcastFilter::default().admits(&Accountability::default()));
    }

    #[test]
    fn test_builder_installs_heartbeat_when_enabled() {
        let gw = gateway(GatewayConfig::default());
        assert_eq!(
            gw.router().handler_names(),
            vec!["auth", "heartbeat", "items", "subscribe"]
        );

        let gw = gateway(GatewayConfig::default().with_heartbeat(false));
        assert_eq!(gw.router().handler_names(), vec!["auth", "items", "subscribe"]);
    }

    fn with_schema(config: GatewayConfig) -> Arc<Gateway> {
        let store = MockCollectionService::new();
        GatewayBuilder::new(
            config,
            Arc::new(store.clone()),
            Arc::new(MockIdentityResolver::new()),
            Arc::new(MockAuthenticator::new()),
        )
        .with_schema(Arc::new(MockSchemaService::new(store)))
        .build()
    }

    #[test]
    fn test_schema_endpoint_mounts_only_with_schema() {
        assert_eq!(gateway(GatewayConfig::default()).endpoint_paths(), vec!["/websocket"]);
        assert_eq!(
            with_schema(GatewayConfig::default()).endpoint_paths(),
            vec!["/websocket", "/graphql"]
        );

        let mut config = GatewayConfig::default();
        config.graphql.enabled = false;
        assert_eq!(with_schema(config).endpoint_paths(), vec!["/websocket"]);

        let mut config = GatewayConfig::default();
        config.enabled = false;
        assert_eq!(with_schema(config).endpoint_paths(), vec!["/graphql"]);
    }

    #[test]
    fn test_schema_endpoint_auth_follows_public_flag() {
        let mut config = GatewayConfig::default().with_auth(AuthMode::handshake_default());
        config.graphql.public = false;
        let gw = with_schema(config);
        let auth: Vec<AuthMode> = gw.endpoints.iter().map(|e| e.auth).collect();
        assert_eq!(auth, vec![AuthMode::handshake_default(), AuthMode::Strict]);
        assert_eq!(gw.endpoints[1].protocol.subprotocols(), ["graphql-transport-ws"]);
    }

    #[tokio::test]
    async fn test_broadcast_and_terminate() {
        let gw = gateway(GatewayConfig::default());
        let mut editor = register(
            &gw,
            Accountability {
                user: Some("user-1".into()),
                role: Some("editor".into()),
                ..Default::default()
            },
        );
        let mut public = register(&gw, Accountability::default());
        assert_eq!(gw.connection_count(), 2);

        let sent = gw.broadcast(
            &json!({"type": "notice"}),
            &BroadcastFilter {
                role: Some("editor".into()),
                ..Default::default()
            },
        );
        assert_eq!(sent, 1);
        assert_eq!(
            editor.try_recv().unwrap(),
            Outbound::Text(r#"{"type":"notice"}"#.into())
        );
        assert!(public.try_recv().is_err());

        gw.terminate();
        assert_eq!(editor.try_recv().unwrap(), Outbound::Close);
        assert_eq!(public.try_recv().unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn test_authorize_upgrade_requires_user() {
        let gw = gateway(GatewayConfig::default());
        assert!(gw.authorize_upgrade(Some("tok-1".into())).await.is_ok());
        assert!(matches!(
            gw.authorize_upgrade(None).await,
            Err(GatewayError::UpgradeRejected(_))
        ));
        assert!(matches!(
            gw.authorize_upgrade(Some("nope".into())).await,
            Err(GatewayError::UpgradeRejected(_))
        ));
    }

    #[test]
    fn test_disabled_gateway_serves_nothing() {
        let mut config = GatewayConfig::default();
        config.enabled = false;
        let gw = gateway(config);
        let _router: Router = gw.routes();
        assert_eq!(gw.connection_count(), 0);
    }
}

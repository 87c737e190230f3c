//! Shared harness for gateway integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_core::mock::{
    Access, MockAuthenticator, MockCollectionService, MockIdentityResolver, MockSchemaService,
};
use relay_core::{Accountability, MutationBus};
use relay_gateway::{Gateway, GatewayBuilder, GatewayConfig, GatewayEvent};
use serde_json::Value as JsonValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const EDITOR_TOKEN: &str = "editor-token";
pub const EDITOR_EMAIL: &str = "ada@example.com";
pub const EDITOR_PASSWORD: &str = "secret";

pub struct TestServer {
    pub url: String,
    /// Schema endpoint URL.
    pub schema_url: String,
    pub schema: MockSchemaService,
    pub gateway: Arc<Gateway>,
    pub store: MockCollectionService,
    pub identity: MockIdentityResolver,
    pub bus: Arc<MutationBus>,
}

/// Start a gateway on an ephemeral port, with the in-memory schema installed.
///
/// Role `editor` can read and write `articles`; the public role has no grants.
pub async fn spawn_gateway(config: GatewayConfig) -> TestServer {
    let bus = Arc::new(MutationBus::new(32));
    let store = MockCollectionService::new()
        .with_bus(bus.clone())
        .with_grant(Some("editor"), "articles", Access::ReadWrite);
    let identity = MockIdentityResolver::new()
        .with_role("editor", false)
        .with_token(EDITOR_TOKEN, "ada", Some("editor"));
    let authenticator =
        MockAuthenticator::new().with_user(EDITOR_EMAIL, EDITOR_PASSWORD, EDITOR_TOKEN);

    let schema = MockSchemaService::new(store.clone());

    let gateway = GatewayBuilder::new(
        config.clone(),
        Arc::new(store.clone()),
        Arc::new(identity.clone()),
        Arc::new(authenticator),
    )
    .with_schema(Arc::new(schema.clone()))
    .build();
    gateway.spawn_dispatcher(&bus);

    let router = gateway.routes();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // Give server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        url: format!("ws://{}{}", addr, config.path),
        schema_url: format!("ws://{}{}", addr, config.graphql.path),
        schema,
        gateway,
        store,
        identity,
        bus,
    }
}

pub fn admin() -> Accountability {
    Accountability {
        admin: true,
        ..Default::default()
    }
}

pub async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

pub async fn send_json(ws: &mut Ws, value: JsonValue) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Wait for the next text frame, skipping control frames. Panics after 5s.
pub async fn next_text_message(ws: &mut Ws) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for text frame")
}

pub async fn next_json(ws: &mut Ws) -> JsonValue {
    serde_json::from_str(&next_text_message(ws).await).unwrap()
}

/// Assert no text frame arrives within `wait`.
pub async fn expect_silence(ws: &mut Ws, wait: Duration) {
    let result = tokio::time::timeout(wait, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {:?}", other),
            }
        }
    })
    .await;
    if let Ok(text) = result {
        panic!("unexpected frame: {}", text);
    }
}

/// PING and wait for the pong. Frames are handled in order, so everything
/// sent before has been processed once this returns.
pub async fn sync(ws: &mut Ws) {
    send_json(ws, serde_json::json!({"type": "PING"})).await;
    let pong = next_json(ws).await;
    assert_eq!(pong, serde_json::json!({"type": "pong"}));
}

/// True once the server has closed the stream.
pub async fn closed_by_server(ws: &mut Ws, wait: Duration) -> bool {
    tokio::time::timeout(wait, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .is_ok()
}

/// Wait for the next lifecycle event matching `pred`.
pub async fn wait_event(
    rx: &mut tokio::sync::broadcast::Receiver<GatewayEvent>,
    pred: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for gateway event")
}

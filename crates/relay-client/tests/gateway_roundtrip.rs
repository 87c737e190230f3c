//! Connector against a live gateway.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_client::{
    ConnectionOptions, Connector, ConnectorEvent, ConnectorState, EventKind, HandshakeCredentials,
    UrlOptions,
};
use relay_core::mock::{Access, MockAuthenticator, MockCollectionService, MockIdentityResolver};
use relay_core::{Accountability, CollectionService, MutationBus, Query};
use relay_gateway::{AuthMode, GatewayBuilder, GatewayConfig};
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;

async fn spawn_gateway() -> (SocketAddr, MockCollectionService) {
    let bus = Arc::new(MutationBus::new(32));
    let store = MockCollectionService::new()
        .with_bus(bus.clone())
        .with_grant(Some("editor"), "articles", Access::ReadWrite);
    let identity = MockIdentityResolver::new()
        .with_role("editor", false)
        .with_token("editor-token", "ada", Some("editor"));

    let config = GatewayConfig::default().with_auth(AuthMode::Handshake {
        timeout: Duration::from_secs(2),
    });
    let gateway = GatewayBuilder::new(
        config,
        Arc::new(store.clone()),
        Arc::new(identity),
        Arc::new(MockAuthenticator::new()),
    )
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
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, store)
}

fn admin() -> Accountability {
    Accountability {
        admin: true,
        ..Accountability::default()
    }
}

#[tokio::test]
async fn test_handshake_get_and_subscription_push() {
    let (addr, store) = spawn_gateway().await;
    store.seed("articles", vec![json!({"id": 1, "title": "first"})]);

    let options = ConnectionOptions::default()
        .with_heartbeat(None)
        .with_message_delay(Duration::ZERO)
        .with_handshake(HandshakeCredentials::AccessToken("editor-token".into()));
    let connector = Connector::init(UrlOptions::new(addr.to_string()), Some(options));

    let (tx, mut pushes) = mpsc::unbounded_channel::<JsonValue>();
    connector.on(EventKind::Message, move |event| {
        if let ConnectorEvent::Message(frame) = event {
            if let Some(payload) = frame.get("payload") {
                let _ = tx.send(payload.clone());
            }
        }
    });

    // Queued before the socket exists; the handshake still goes first.
    let uid = connector.subscribe("articles", Query::default()).unwrap();
    connector.connect();

    let rows = connector.get("articles", Query::default()).await.unwrap();
    assert_eq!(rows, json!([{"id": 1, "title": "first"}]));
    assert_eq!(connector.state(), ConnectorState::Connected);

    store
        .create_one("articles", json!({"title": "second"}), &admin())
        .await
        .unwrap();
    let payload = tokio::time::timeout(Duration::from_secs(5), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, json!({"id": 2, "title": "second"}));

    // The GET response round trip orders the unsubscribe before the next write.
    connector.unsubscribe(&uid);
    connector.get("articles", Query::default()).await.unwrap();
    store
        .create_one("articles", json!({"title": "third"}), &admin())
        .await
        .unwrap();
    let silence = tokio::time::timeout(Duration::from_millis(300), pushes.recv()).await;
    assert!(silence.is_err(), "unexpected push after unsubscribe");
}

fn count(connector: &Connector, kind: EventKind) -> Arc<AtomicUsize> {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    connector.on(kind, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    seen
}

#[tokio::test]
async fn test_rejected_handshake_spends_retry_budget_and_keeps_frames() {
    let (addr, _store) = spawn_gateway().await;

    let options = ConnectionOptions::default()
        .with_heartbeat(None)
        .with_message_delay(Duration::ZERO)
        .with_base_delay(Duration::from_millis(10))
        .with_max_retries(2)
        .with_handshake(HandshakeCredentials::AccessToken("wrong-token".into()));
    let connector = Connector::init(UrlOptions::new(addr.to_string()), Some(options));
    let opens = count(&connector, EventKind::Open);
    let closes = count(&connector, EventKind::Close);
    let (tx, mut errors) = mpsc::unbounded_channel::<JsonValue>();
    connector.on(EventKind::Message, move |event| {
        if let ConnectorEvent::Message(frame) = event {
            let _ = tx.send(frame.clone());
        }
    });

    connector.send(&json!({"type": "PING"})).unwrap();
    connector.connect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while closes.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connector did not give up");
    // Give a runaway reconnect loop time to show itself.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The first attempt plus two retries, then nothing.
    assert_eq!(opens.load(Ordering::SeqCst), 3);
    assert_eq!(closes.load(Ordering::SeqCst), 3);
    assert_eq!(connector.retries(), 2);
    assert_eq!(connector.state(), ConnectorState::Disconnected);

    let rejection = errors.recv().await.unwrap();
    assert!(rejection["error"].as_str().is_some());

    // The PING was never answered, so it is still waiting for a connection.
    assert_eq!(connector.queued(), 1);
}

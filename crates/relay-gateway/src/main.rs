//! relay-gateway - development server for the real-time subscription protocol
//!
//! Serves the gateway over the in-memory collaborators, optionally seeded
//! from the JSON fixture named by `RELAY_SEED_FILE`. The schema endpoint is
//! backed by the in-memory schema over the same collections.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use relay_core::mock::{
    MockAuthenticator, MockCollectionService, MockIdentityResolver, MockSchemaService,
};
use relay_core::MutationBus;
use relay_gateway::seed::Seed;
use relay_gateway::{GatewayBuilder, GatewayConfig};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "relay_gateway=debug,tower_http=debug")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_gateway=debug,relay_core=info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = match &log_file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("relay-gateway.log");
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            if log_format == "json" {
                registry
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(writer)
                            .with_ansi(log_ansi.unwrap_or(false)),
                    )
                    .init();
            }
            Some(guard)
        }
        None => {
            if log_format == "json" {
                registry.with(tracing_subscriber::fmt::layer().json()).init();
            } else {
                let mut layer = tracing_subscriber::fmt::layer();
                if let Some(ansi) = log_ansi {
                    layer = layer.with_ansi(ansi);
                }
                registry.with(layer).init();
            }
            None
        }
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = GatewayConfig::from_env()?;
    let bus = Arc::new(MutationBus::new(config.event_capacity));
    let collections = MockCollectionService::new().with_bus(bus.clone());
    let identity = MockIdentityResolver::new();
    let mut authenticator = MockAuthenticator::new();

    if let Ok(path) = std::env::var("RELAY_SEED_FILE") {
        let seed = Seed::from_file(Path::new(&path))?;
        authenticator = seed.apply(&collections, &identity, authenticator);
        info!(seed_file = %path, "Development fixture loaded");
    }

    let schema = MockSchemaService::new(collections.clone());
    let gateway = GatewayBuilder::new(
        config.clone(),
        Arc::new(collections),
        Arc::new(identity),
        Arc::new(authenticator),
    )
    .with_schema(Arc::new(schema))
    .build();
    let _dispatcher = gateway.spawn_dispatcher(&bus);

    let app = gateway.routes().layer(TraceLayer::new_for_http());
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        address = %addr,
        endpoints = ?gateway.endpoint_paths(),
        auth_mode = %config.auth,
        public = config.public,
        "relay-gateway listening"
    );

    let shutdown_gateway = gateway.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
        shutdown_gateway.terminate();
    })
    .await?;

    Ok(())
}

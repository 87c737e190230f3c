//! # relay-gateway
//!
//! Real-time subscription gateway. Upgrades HTTP requests to WebSocket
//! connections, authenticates them (`public`, `strict` or `handshake`),
//! routes their frames to capability handlers, and pushes collection
//! mutations to subscribers after re-checking their permissions.
//!
//! With a [`relay_core::SchemaService`] installed, a second endpoint
//! (default `/graphql`) speaks `graphql-transport-ws` against that schema.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relay_core::mock::{MockAuthenticator, MockCollectionService, MockIdentityResolver};
//! use relay_core::MutationBus;
//! use relay_gateway::{GatewayBuilder, GatewayConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let bus = Arc::new(MutationBus::default());
//! let collections = MockCollectionService::new().with_bus(bus.clone());
//! let gateway = GatewayBuilder::new(
//!     GatewayConfig::from_env()?,
//!     Arc::new(collections),
//!     Arc::new(MockIdentityResolver::new()),
//!     Arc::new(MockAuthenticator::new()),
//! )
//! .build();
//! gateway.spawn_dispatcher(&bus);
//!
//! let listener = tokio::net::TcpListener::bind(gateway.config().bind_address()).await?;
//! axum::serve(listener, gateway.routes()).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod schema;
pub mod seed;

pub use config::{AuthMode, ConfigError, GatewayConfig, SchemaEndpointConfig};
pub use connection::{Connection, ConnectionState};
pub use dispatcher::EventDispatcher;
pub use error::{GatewayError, Result};
pub use frame::{ClientFrame, ServerFrame};
pub use gateway::{BroadcastFilter, Gateway, GatewayBuilder, GatewayEvent};
pub use registry::{Subscription, SubscriptionRegistry};
pub use router::{FrameProtocol, MessageRouter, SocketHandler};
pub use schema::SchemaProtocol;

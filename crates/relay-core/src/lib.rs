//! # relay-core
//!
//! Core types, collaborator traits, and the mutation bus for the relay
//! real-time gateway.
//!
//! This crate provides the data the gateway and the connector share
//! ([`Accountability`], [`Query`], [`PrimaryKey`], [`MutationEvent`]) and the
//! trait boundaries to the systems the gateway does not own: the
//! [`CollectionService`], the [`IdentityResolver`], the [`Authenticator`]
//! and the [`SchemaService`] behind the schema endpoint.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue (rejected upgrade, failed handshake, lagged bus) |
//! | INFO  | Lifecycle events (startup, connection open/close, connector state) |
//! | DEBUG | Decision points (admission denied, delivery skipped, frame routed) |
//! | TRACE | Per-frame traffic |

pub mod accountability;
pub mod defaults;
pub mod error;
pub mod events;
pub mod filter;
pub mod heartbeat;
pub mod mock;
pub mod query;
pub mod traits;

// Re-export commonly used types at crate root
pub use accountability::Accountability;
pub use error::{Error, Result};
pub use events::{MutationAction, MutationBus, MutationEvent};
pub use heartbeat::{HeartbeatConfig, LivenessTracker};
pub use query::{PrimaryKey, Query};
pub use traits::{
    AuthTokens, Authenticator, CollectionService, IdentityResolver, SchemaRequest, SchemaService,
};

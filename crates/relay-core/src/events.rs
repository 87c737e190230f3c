//! Collection mutation events and the bus that carries them.
//!
//! The Collection Service's write path emits a [`MutationEvent`] after every
//! create, update or delete. Consumers (the subscription dispatcher, audit
//! sinks, tests) subscribe to the [`MutationBus`] independently. Emitting never
//! waits on consumers, so dispatch stays fire-and-forget relative to the write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::query::PrimaryKey;

/// Kind of write that produced a mutation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

/// A write against a collection.
///
/// For `create` and `update` the affected rows are identified by `keys` and
/// must be read back by consumers. For `delete` the rows are gone, so the
/// deleted-key payload is carried in `payload`.
#[derive(Debug, Clone, Serialize)]
pub struct MutationEvent {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    pub collection: String,
    pub action: MutationAction,
    pub keys: Vec<PrimaryKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

impl MutationEvent {
    fn new(
        collection: impl Into<String>,
        action: MutationAction,
        keys: Vec<PrimaryKey>,
        payload: Option<JsonValue>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            collection: collection.into(),
            action,
            keys,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Rows were created with the given keys.
    pub fn created(collection: impl Into<String>, keys: Vec<PrimaryKey>) -> Self {
        Self::new(collection, MutationAction::Create, keys, None)
    }

    /// Rows with the given keys were updated.
    pub fn updated(collection: impl Into<String>, keys: Vec<PrimaryKey>) -> Self {
        Self::new(collection, MutationAction::Update, keys, None)
    }

    /// Rows with the given keys were deleted. The payload defaults to the key list.
    pub fn deleted(collection: impl Into<String>, keys: Vec<PrimaryKey>) -> Self {
        let payload = JsonValue::Array(keys.iter().map(PrimaryKey::to_json).collect());
        Self::new(collection, MutationAction::Delete, keys, Some(payload))
    }

    /// Replace the payload carried with the event.
    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Lifecycle signal name, e.g. `"articles.create"`.
    pub fn signal(&self) -> String {
        format!("{}.{}", self.collection, self.action.as_str())
    }

    /// True when exactly one row was affected.
    pub fn is_single(&self) -> bool {
        self.keys.len() == 1
    }
}

/// Broadcast channel for collection mutation events.
///
/// Uses `tokio::sync::broadcast` with a configurable buffer size. Receivers
/// that fall behind get a `Lagged` error and miss events; subscription pushes
/// are best-effort, so freshness wins over completeness.
#[derive(Debug)]
pub struct MutationBus {
    tx: broadcast::Sender<MutationEvent>,
}

impl MutationBus {
    /// Create a new bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all listeners. Dropped silently without listeners.
    pub fn emit(&self, event: MutationEvent) {
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            signal = %event.signal(),
            event_id = %event.event_id,
            key_count = event.keys.len(),
            subscriber_count,
            "MutationBus emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to mutation events. Each listener gets its own independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active listeners.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MutationBus {
    fn default() -> Self {
        Self::new(crate::defaults::MUTATION_BUS_CAPACITY)
    }
}

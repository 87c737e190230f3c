//! Mutation fan-out to subscribers.
//!
//! The dispatcher consumes [`MutationEvent`]s from the [`MutationBus`] and,
//! for every subscription on the affected collection, re-authorizes the
//! subscriber and reads the affected rows through the subscription's query
//! before pushing them. Writers never wait on this.

use std::sync::Arc;

use relay_core::{CollectionService, IdentityResolver, MutationAction, MutationBus, MutationEvent};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::auth::refresh_accountability;
use crate::error::Result;
use crate::frame::ServerFrame;
use crate::registry::{Subscription, SubscriptionRegistry};

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Nothing left to push after filtering.
    Empty,
    /// The connection is gone or closed.
    Gone,
    /// Re-authorization or the read failed.
    Skipped,
}

pub struct EventDispatcher {
    registry: Arc<SubscriptionRegistry>,
    collections: Arc<dyn CollectionService>,
    identity: Arc<dyn IdentityResolver>,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        collections: Arc<dyn CollectionService>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            registry,
            collections,
            identity,
        }
    }

    /// Deliver one event to every subscriber of its collection.
    ///
    /// Iterates a snapshot, so subscriptions removed while this runs may
    /// still see one last delivery attempt, which is a no-op on a closed
    /// connection.
    pub async fn dispatch(&self, event: &MutationEvent) -> Vec<Delivery> {
        let subscriptions = self.registry.snapshot(&event.collection);
        if subscriptions.is_empty() {
            return Vec::new();
        }

        tracing::debug!(
            signal = %event.signal(),
            event_id = %event.event_id,
            subscribers = subscriptions.len(),
            "Dispatching mutation"
        );

        let mut outcomes = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let outcome = match self.deliver(subscription, event).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The subscriber stays registered; it is simply not told.
                    tracing::debug!(
                        connection_id = %subscription.connection_id,
                        collection = %event.collection,
                        error = %e,
                        "Delivery skipped"
                    );
                    Delivery::Skipped
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn deliver(&self, subscription: &Subscription, event: &MutationEvent) -> Result<Delivery> {
        let Some(connection) = subscription.connection() else {
            return Ok(Delivery::Gone);
        };
        if !connection.is_open() {
            return Ok(Delivery::Gone);
        }

        let refreshed =
            refresh_accountability(self.identity.as_ref(), &connection.accountability()).await?;
        connection.set_accountability(refreshed.clone());

        let records = match event.action {
            MutationAction::Delete => event.payload.clone().unwrap_or(JsonValue::Null),
            MutationAction::Create | MutationAction::Update => {
                let query = subscription.query.clone().unwrap_or_default();
                JsonValue::Array(
                    self.collections
                        .read_many(&event.collection, &event.keys, &query, &refreshed)
                        .await?,
                )
            }
        };

        let Some(payload) = shape_payload(records, event.is_single()) else {
            return Ok(Delivery::Empty);
        };

        if connection.send(&ServerFrame::Payload(payload)) {
            tracing::trace!(
                connection_id = %connection.id(),
                signal = %event.signal(),
                "Payload pushed"
            );
            Ok(Delivery::Sent)
        } else {
            Ok(Delivery::Gone)
        }
    }

    /// Consume the bus until it closes.
    pub fn spawn(self: Arc<Self>, bus: &MutationBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            tracing::info!("Event dispatcher started");
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        self.dispatch(&event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event dispatcher lagged, mutations dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::info!("Event dispatcher stopped");
        })
    }
}

/// Unwrap single-key results and drop empty ones.
fn shape_payload(records: JsonValue, single: bool) -> Option<JsonValue> {
    match records {
        JsonValue::Null => None,
        JsonValue::Array(mut rows) => {
            if rows.is_empty() {
                None
            } else if single && rows.len() == 1 {
                rows.pop()
            } else {
                Some(JsonValue::Array(rows))
            }
        }
        other => Some(other),
    }
}

//! Subscription registry.
//!
//! Maps a collection name to the subscriptions interested in it. The registry
//! is the one piece of state shared by inbound handlers, connection teardown
//! and dispatch, so every access goes through a single mutex and dispatch
//! iterates over a copied snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use relay_core::defaults::ADMISSION_READ_LIMIT;
use relay_core::{CollectionService, Query};
use uuid::Uuid;

use crate::connection::Connection;

/// A standing registration of a connection's interest in a collection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub collection: String,
    pub query: Option<Query>,
    /// Client correlation id from the `SUBSCRIBE` frame.
    pub uid: Option<String>,
    pub connection_id: Uuid,
    connection: Weak<Connection>,
}

impl Subscription {
    /// The subscribed connection, if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }
}

pub struct SubscriptionRegistry {
    collections: Arc<dyn CollectionService>,
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new(collections: Arc<dyn CollectionService>) -> Self {
        Self {
            collections,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a subscription after an admission read.
    ///
    /// The admission read runs `query` with a hard limit of one row under the
    /// connection's current accountability. If the read fails, or the
    /// connection closed while it was in flight, nothing is registered and
    /// `None` is returned. No frame is sent either way.
    pub async fn subscribe(
        &self,
        collection: &str,
        connection: &Arc<Connection>,
        query: Option<Query>,
        uid: Option<String>,
    ) -> Option<Subscription> {
        let admission = query.clone().unwrap_or_default().with_limit(ADMISSION_READ_LIMIT);
        let accountability = connection.accountability();

        if let Err(e) = self
            .collections
            .read_by_query(collection, &admission, &accountability)
            .await
        {
            tracing::debug!(
                connection_id = %connection.id(),
                collection,
                error = %e,
                "Subscription denied by admission read"
            );
            return None;
        }

        if !connection.is_open() {
            tracing::debug!(
                connection_id = %connection.id(),
                collection,
                "Connection closed during admission read, not subscribing"
            );
            return None;
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            collection: collection.to_string(),
            query,
            uid,
            connection_id: connection.id(),
            connection: Arc::downgrade(connection),
        };
        self.lock()
            .entry(collection.to_string())
            .or_default()
            .push(subscription.clone());

        tracing::debug!(
            connection_id = %connection.id(),
            collection,
            subscription_id = %subscription.id,
            "Subscription registered"
        );
        Some(subscription)
    }

    /// Remove every subscription held by `connection_id`. Idempotent.
    pub fn unsubscribe(&self, connection_id: Uuid) -> usize {
        self.remove_where(|s| s.connection_id == connection_id)
    }

    /// Remove the connection's subscription registered under `uid`.
    pub fn unsubscribe_uid(&self, connection_id: Uuid, uid: &str) -> usize {
        self.remove_where(|s| s.connection_id == connection_id && s.uid.as_deref() == Some(uid))
    }

    /// Remove the connection's subscriptions on `collection`.
    pub fn unsubscribe_collection(&self, connection_id: Uuid, collection: &str) -> usize {
        let mut map = self.lock();
        let Some(subs) = map.get_mut(collection) else {
            return 0;
        };
        let before = subs.len();
        subs.retain(|s| s.connection_id != connection_id);
        let removed = before - subs.len();
        if subs.is_empty() {
            map.remove(collection);
        }
        removed
    }

    fn remove_where(&self, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let mut map = self.lock();
        let mut removed = 0;
        map.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| !predicate(s));
            removed += before - subs.len();
            !subs.is_empty()
        });
        removed
    }

    /// Copy of the subscriptions on `collection`. Empty when absent.
    pub fn snapshot(&self, collection: &str) -> Vec<Subscription> {
        self.lock().get(collection).cloned().unwrap_or_default()
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscriptions held by one connection.
    pub fn count_for(&self, connection_id: Uuid) -> usize {
        self.lock()
            .values()
            .flatten()
            .filter(|s| s.connection_id == connection_id)
            .count()
    }
}

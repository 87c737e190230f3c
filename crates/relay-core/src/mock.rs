//! In-memory collaborators for deterministic testing and local development.
//!
//! Provides a [`MockCollectionService`] backed by per-collection maps with
//! role-based read/write grants, a [`MockIdentityResolver`] with a token and
//! role table, a [`MockAuthenticator`] with an email/password table, and a
//! [`MockSchemaService`] exposing one root field per collection.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use relay_core::mock::{Access, MockCollectionService, MockIdentityResolver};
//! use relay_core::MutationBus;
//!
//! let bus = Arc::new(MutationBus::new(32));
//! let items = MockCollectionService::new()
//!     .with_bus(bus.clone())
//!     .with_grant(Some("editor"), "articles", Access::ReadWrite);
//! let identity = MockIdentityResolver::new()
//!     .with_role("editor", false)
//!     .with_token("token-1", "user-1", Some("editor"));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value as JsonValue};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::accountability::Accountability;
use crate::error::{Error, Result};
use crate::events::{MutationBus, MutationEvent};
use crate::filter;
use crate::query::{PrimaryKey, Query};
use crate::traits::{
    AuthTokens, Authenticator, CollectionService, IdentityResolver, SchemaRequest, SchemaService,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// COLLECTION SERVICE
// =============================================================================

/// Access level granted to a role on a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone)]
struct Grant {
    access: Access,
    /// Row-level read filter applied on top of the caller's query.
    rows: Option<JsonValue>,
}

/// A recorded call against the mock service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub operation: &'static str,
    pub collection: String,
}

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<PrimaryKey, JsonValue>>,
    grants: HashMap<(Option<String>, String), Grant>,
    next_id: i64,
    calls: Vec<MockCall>,
}

/// In-memory Collection Service with role grants and mutation events.
///
/// Records are keyed by their `id` field; creates without one get the next
/// integer id. Admin accountabilities bypass grants. Every successful write
/// emits a [`MutationEvent`] on the attached bus.
#[derive(Clone, Default)]
pub struct MockCollectionService {
    state: Arc<Mutex<StoreState>>,
    bus: Option<Arc<MutationBus>>,
}

impl MockCollectionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit mutation events on `bus` after each write.
    pub fn with_bus(mut self, bus: Arc<MutationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Grant `role` (`None` = public) access to `collection`.
    pub fn with_grant(self, role: Option<&str>, collection: &str, access: Access) -> Self {
        self.grant(role, collection, access);
        self
    }

    pub fn grant(&self, role: Option<&str>, collection: &str, access: Access) {
        lock(&self.state).grants.insert(
            (role.map(String::from), collection.to_string()),
            Grant { access, rows: None },
        );
    }

    /// Grant read access restricted to rows matching `rows`.
    pub fn grant_rows(&self, role: Option<&str>, collection: &str, rows: JsonValue) {
        lock(&self.state).grants.insert(
            (role.map(String::from), collection.to_string()),
            Grant {
                access: Access::Read,
                rows: Some(rows),
            },
        );
    }

    /// Remove a grant. Later reads by that role fail with `Forbidden`.
    pub fn revoke(&self, role: Option<&str>, collection: &str) {
        lock(&self.state)
            .grants
            .remove(&(role.map(String::from), collection.to_string()));
    }

    /// Insert records directly, bypassing permissions and events.
    pub fn seed(&self, collection: &str, records: Vec<JsonValue>) {
        let mut state = lock(&self.state);
        for record in records {
            let key = Self::assign_key(&mut state, &record);
            let record = Self::with_id(record, &key);
            state
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(key, record);
        }
    }

    /// Calls made so far, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    /// Number of records currently stored in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        lock(&self.state)
            .collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn record_call(state: &mut StoreState, operation: &'static str, collection: &str) {
        state.calls.push(MockCall {
            operation,
            collection: collection.to_string(),
        });
    }

    fn assign_key(state: &mut StoreState, record: &JsonValue) -> PrimaryKey {
        if let Some(key) = record.get("id").and_then(PrimaryKey::from_json) {
            if let PrimaryKey::Int(i) = key {
                state.next_id = state.next_id.max(i);
            }
            return key;
        }
        state.next_id += 1;
        PrimaryKey::Int(state.next_id)
    }

    fn with_id(mut record: JsonValue, key: &PrimaryKey) -> JsonValue {
        if let Some(obj) = record.as_object_mut() {
            obj.insert("id".to_string(), key.to_json());
        }
        record
    }

    /// Returns the row filter to apply, or `Forbidden`.
    fn authorize(
        state: &StoreState,
        collection: &str,
        accountability: &Accountability,
        write: bool,
    ) -> Result<Option<JsonValue>> {
        if accountability.admin {
            return Ok(None);
        }
        let grant = state
            .grants
            .get(&(accountability.role.clone(), collection.to_string()))
            .ok_or_else(|| {
                Error::Forbidden(format!(
                    "You don't have permission to access collection \"{}\"",
                    collection
                ))
            })?;
        if write && grant.access != Access::ReadWrite {
            return Err(Error::Forbidden(format!(
                "You don't have permission to write to collection \"{}\"",
                collection
            )));
        }
        Ok(grant.rows.clone())
    }

    fn select(
        state: &StoreState,
        collection: &str,
        keys: Option<&[PrimaryKey]>,
        query: &Query,
        rows: Option<&JsonValue>,
    ) -> Vec<JsonValue> {
        let Some(records) = state.collections.get(collection) else {
            return Vec::new();
        };
        let visible = |r: &&JsonValue| {
            rows.map(|f| filter::matches(r, f)).unwrap_or(true)
                && query
                    .filter
                    .as_ref()
                    .map(|f| filter::matches(r, f))
                    .unwrap_or(true)
        };
        let candidates: Vec<&JsonValue> = match keys {
            Some(keys) => keys.iter().filter_map(|k| records.get(k)).collect(),
            None => records.values().collect(),
        };
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = match query.limit {
            Some(l) if l >= 0 => l as usize,
            _ => usize::MAX,
        };
        candidates
            .into_iter()
            .filter(visible)
            .skip(offset)
            .take(limit)
            .map(|r| filter::project(r, query.fields.as_deref()))
            .collect()
    }

    fn emit(&self, event: MutationEvent) {
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }
}

#[async_trait]
impl CollectionService for MockCollectionService {
    async fn create_one(
        &self,
        collection: &str,
        data: JsonValue,
        accountability: &Accountability,
    ) -> Result<PrimaryKey> {
        let mut keys = self
            .create_many(collection, vec![data], accountability)
            .await?;
        keys.pop()
            .ok_or_else(|| Error::Internal("create returned no key".to_string()))
    }

    async fn create_many(
        &self,
        collection: &str,
        data: Vec<JsonValue>,
        accountability: &Accountability,
    ) -> Result<Vec<PrimaryKey>> {
        let keys = {
            let mut state = lock(&self.state);
            Self::record_call(&mut state, "create", collection);
            Self::authorize(&state, collection, accountability, true)?;
            if data.iter().any(|d| !d.is_object()) {
                return Err(Error::InvalidPayload(
                    "records must be JSON objects".to_string(),
                ));
            }
            let mut keys = Vec::with_capacity(data.len());
            for record in data {
                let key = Self::assign_key(&mut state, &record);
                let record = Self::with_id(record, &key);
                state
                    .collections
                    .entry(collection.to_string())
                    .or_default()
                    .insert(key.clone(), record);
                keys.push(key);
            }
            keys
        };
        self.emit(MutationEvent::created(collection, keys.clone()));
        Ok(keys)
    }

    async fn read_one(
        &self,
        collection: &str,
        key: &PrimaryKey,
        query: &Query,
        accountability: &Accountability,
    ) -> Result<JsonValue> {
        let mut records = self
            .read_many(collection, std::slice::from_ref(key), query, accountability)
            .await?;
        if records.is_empty() {
            return Err(Error::NotFound(format!("{} {}", collection, key)));
        }
        Ok(records.swap_remove(0))
    }

    async fn read_many(
        &self,
        collection: &str,
        keys: &[PrimaryKey],
        query: &Query,
        accountability: &Accountability,
    ) -> Result<Vec<JsonValue>> {
        let mut state = lock(&self.state);
        Self::record_call(&mut state, "read", collection);
        let rows = Self::authorize(&state, collection, accountability, false)?;
        Ok(Self::select(
            &state,
            collection,
            Some(keys),
            query,
            rows.as_ref(),
        ))
    }

    async fn read_by_query(
        &self,
        collection: &str,
        query: &Query,
        accountability: &Accountability,
    ) -> Result<Vec<JsonValue>> {
        let mut state = lock(&self.state);
        Self::record_call(&mut state, "read", collection);
        let rows = Self::authorize(&state, collection, accountability, false)?;
        Ok(Self::select(&state, collection, None, query, rows.as_ref()))
    }

    async fn update_one(
        &self,
        collection: &str,
        key: &PrimaryKey,
        data: JsonValue,
        accountability: &Accountability,
    ) -> Result<PrimaryKey> {
        let mut keys = self
            .update_many(collection, std::slice::from_ref(key), data, accountability)
            .await?;
        keys.pop()
            .ok_or_else(|| Error::NotFound(format!("{} {}", collection, key)))
    }

    async fn update_many(
        &self,
        collection: &str,
        keys: &[PrimaryKey],
        data: JsonValue,
        accountability: &Accountability,
    ) -> Result<Vec<PrimaryKey>> {
        let updated = {
            let mut state = lock(&self.state);
            Self::record_call(&mut state, "update", collection);
            Self::authorize(&state, collection, accountability, true)?;
            let patch = data
                .as_object()
                .cloned()
                .ok_or_else(|| Error::InvalidPayload("update data must be an object".into()))?;
            let Some(records) = state.collections.get_mut(collection) else {
                return Ok(Vec::new());
            };
            let mut updated = Vec::new();
            for key in keys {
                if let Some(obj) = records.get_mut(key).and_then(|r| r.as_object_mut()) {
                    for (field, value) in &patch {
                        if field != "id" {
                            obj.insert(field.clone(), value.clone());
                        }
                    }
                    updated.push(key.clone());
                }
            }
            updated
        };
        if !updated.is_empty() {
            self.emit(MutationEvent::updated(collection, updated.clone()));
        }
        Ok(updated)
    }

    async fn delete_one(
        &self,
        collection: &str,
        key: &PrimaryKey,
        accountability: &Accountability,
    ) -> Result<()> {
        self.delete_many(collection, std::slice::from_ref(key), accountability)
            .await
    }

    async fn delete_many(
        &self,
        collection: &str,
        keys: &[PrimaryKey],
        accountability: &Accountability,
    ) -> Result<()> {
        let removed = {
            let mut state = lock(&self.state);
            Self::record_call(&mut state, "delete", collection);
            Self::authorize(&state, collection, accountability, true)?;
            match state.collections.get_mut(collection) {
                Some(records) => keys
                    .iter()
                    .filter(|k| records.remove(*k).is_some())
                    .cloned()
                    .collect::<Vec<_>>(),
                None => Vec::new(),
            }
        };
        if !removed.is_empty() {
            self.emit(MutationEvent::deleted(collection, removed));
        }
        Ok(())
    }
}

// =============================================================================
// IDENTITY RESOLVER
// =============================================================================

#[derive(Debug, Default)]
struct IdentityState {
    tokens: HashMap<String, (String, Option<String>)>,
    roles: HashMap<String, bool>,
    role_lookups: usize,
}

/// Token and role table.
#[derive(Clone, Default)]
pub struct MockIdentityResolver {
    state: Arc<Mutex<IdentityState>>,
}

impl MockIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role; `admin` roles bypass permission checks.
    pub fn with_role(self, role: &str, admin: bool) -> Self {
        lock(&self.state).roles.insert(role.to_string(), admin);
        self
    }

    /// Register a bearer token for `user` with `role`.
    pub fn with_token(self, token: &str, user: &str, role: Option<&str>) -> Self {
        self.add_token(token, user, role);
        self
    }

    pub fn add_token(&self, token: &str, user: &str, role: Option<&str>) {
        lock(&self.state).tokens.insert(
            token.to_string(),
            (user.to_string(), role.map(String::from)),
        );
    }

    pub fn revoke_token(&self, token: &str) {
        lock(&self.state).tokens.remove(token);
    }

    /// Delete a role. Later role resolution for it fails with `Forbidden`.
    pub fn remove_role(&self, role: &str) {
        lock(&self.state).roles.remove(role);
    }

    /// Number of `accountability_for_role` calls so far.
    pub fn role_lookups(&self) -> usize {
        lock(&self.state).role_lookups
    }

    fn role_accountability(
        state: &IdentityState,
        role: Option<&str>,
        user: Option<String>,
    ) -> Result<Accountability> {
        let admin = match role {
            None => false,
            Some(r) => *state
                .roles
                .get(r)
                .ok_or_else(|| Error::Forbidden(format!("role {} no longer exists", r)))?,
        };
        Ok(Accountability {
            user,
            role: role.map(String::from),
            admin,
            ip: None,
            user_agent: None,
        })
    }
}

#[async_trait]
impl IdentityResolver for MockIdentityResolver {
    async fn accountability_for_token(&self, token: Option<&str>) -> Result<Accountability> {
        let state = lock(&self.state);
        let Some(token) = token else {
            return Ok(Accountability::anonymous(None, None));
        };
        let (user, role) = state
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::Unauthorized("Invalid user credentials.".to_string()))?;
        Self::role_accountability(&state, role.as_deref(), Some(user))
    }

    async fn accountability_for_role(
        &self,
        role: Option<&str>,
        current: &Accountability,
    ) -> Result<Accountability> {
        let mut state = lock(&self.state);
        state.role_lookups += 1;
        Ok(Self::role_accountability(&state, role, None)?
            .with_origin(current.ip.clone(), current.user_agent.clone()))
    }
}

// =============================================================================
// AUTHENTICATOR
// =============================================================================

#[derive(Debug, Default)]
struct AuthState {
    users: HashMap<String, (String, String)>,
    refresh_tokens: HashMap<String, String>,
    spent: HashSet<String>,
}

/// Email/password table issuing fixed access tokens and rotating refresh tokens.
#[derive(Clone, Default)]
pub struct MockAuthenticator {
    state: Arc<Mutex<AuthState>>,
}

/// Access token lifetime reported by [`MockAuthenticator`] (15 minutes).
pub const MOCK_TOKEN_TTL_MS: i64 = 900_000;

impl MockAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a login that yields `access_token`.
    pub fn with_user(self, email: &str, password: &str, access_token: &str) -> Self {
        lock(&self.state).users.insert(
            email.to_string(),
            (password.to_string(), access_token.to_string()),
        );
        self
    }

    fn issue(state: &mut AuthState, access_token: String) -> AuthTokens {
        let refresh_token = Uuid::new_v4().to_string();
        state
            .refresh_tokens
            .insert(refresh_token.clone(), access_token.clone());
        AuthTokens {
            access_token,
            refresh_token,
            expires: MOCK_TOKEN_TTL_MS,
        }
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn login(&self, email: &str, password: &str) -> Result<AuthTokens> {
        let mut state = lock(&self.state);
        let access = match state.users.get(email) {
            Some((expected, access)) if expected == password => access.clone(),
            _ => return Err(Error::Unauthorized("Invalid user credentials.".to_string())),
        };
        Ok(Self::issue(&mut state, access))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthTokens> {
        let mut state = lock(&self.state);
        if state.spent.contains(refresh_token) {
            return Err(Error::Unauthorized("Invalid refresh token.".to_string()));
        }
        let access = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| Error::Unauthorized("Invalid refresh token.".to_string()))?;
        state.spent.insert(refresh_token.to_string());
        Ok(Self::issue(&mut state, access))
    }
}

// =============================================================================
// SCHEMA SERVICE
// =============================================================================

/// Root field selected by an operation: `{ articles }` or
/// `subscription { articles_mutated }`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RootField {
    Read(String),
    Mutated(String),
}

impl RootField {
    fn parse(query: &str) -> Option<Self> {
        let query = query.trim();
        let subscription = query.starts_with("subscription");
        let body = &query[query.find('{')? + 1..];
        let field: String = body
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if field.is_empty() {
            return None;
        }
        match field.strip_suffix("_mutated") {
            Some(collection) if subscription => Some(RootField::Mutated(collection.to_string())),
            _ if subscription => None,
            _ => Some(RootField::Read(field)),
        }
    }
}

/// Schema over a [`MockCollectionService`].
///
/// `{ <collection> }` reads the collection under the caller's accountability.
/// `subscription { <collection>_mutated }` streams one result per mutation
/// event on that collection, after checking the caller may read it.
/// Executions are recorded with the user they ran as.
#[derive(Clone)]
pub struct MockSchemaService {
    collections: MockCollectionService,
    executions: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl MockSchemaService {
    pub fn new(collections: MockCollectionService) -> Self {
        Self {
            collections,
            executions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `(query, user)` pairs executed so far, oldest first.
    pub fn executions(&self) -> Vec<(String, Option<String>)> {
        lock(&self.executions).clone()
    }

    fn mutations(
        rx: broadcast::Receiver<MutationEvent>,
        collection: String,
    ) -> BoxStream<'static, JsonValue> {
        let field = format!("{}_mutated", collection);
        stream::unfold(rx, move |mut rx| {
            let collection = collection.clone();
            let field = field.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.collection == collection => {
                            let keys: Vec<JsonValue> =
                                event.keys.iter().map(PrimaryKey::to_json).collect();
                            let result = json!({
                                "data": { field: { "event": event.action.as_str(), "keys": keys } }
                            });
                            return Some((result, rx));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl SchemaService for MockSchemaService {
    async fn execute(
        &self,
        request: SchemaRequest,
        accountability: &Accountability,
    ) -> Result<BoxStream<'static, JsonValue>> {
        lock(&self.executions).push((request.query.clone(), accountability.user.clone()));
        let root = RootField::parse(&request.query).ok_or_else(|| {
            Error::InvalidInput(format!("Unsupported operation: {}", request.query.trim()))
        })?;

        match root {
            RootField::Read(collection) => {
                let result = match self
                    .collections
                    .read_by_query(&collection, &Query::default(), accountability)
                    .await
                {
                    Ok(rows) => json!({ "data": { collection: rows } }),
                    Err(e) => json!({ "data": null, "errors": [{ "message": e.to_string() }] }),
                };
                Ok(stream::once(async move { result }).boxed())
            }
            RootField::Mutated(collection) => {
                let bus = self.collections.bus.clone().ok_or_else(|| {
                    Error::Service("No mutation bus attached".to_string())
                })?;
                // Subscribe before the permission read so no event slips between.
                let rx = bus.subscribe();
                self.collections
                    .read_by_query(&collection, &Query::default().with_limit(1), accountability)
                    .await?;
                Ok(Self::mutations(rx, collection))
            }
        }
    }
}

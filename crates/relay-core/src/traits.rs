//! Collaborator traits the gateway is written against.
//!
//! The record store, the token/role resolution, the login flow and the
//! query schema all live outside the gateway. These traits are the only way
//! it reaches them, which keeps backends pluggable and the gateway testable
//! against [`crate::mock`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::accountability::Accountability;
use crate::error::Result;
use crate::query::{PrimaryKey, Query};

// =============================================================================
// COLLECTION SERVICE
// =============================================================================

/// CRUD against named collections, authorized by an [`Accountability`].
///
/// Every call is evaluated against the accountability passed in. Callers must
/// pass the snapshot that is current at the moment of the call.
#[async_trait]
pub trait CollectionService: Send + Sync {
    /// Insert one record, returning its key.
    async fn create_one(
        &self,
        collection: &str,
        data: JsonValue,
        accountability: &Accountability,
    ) -> Result<PrimaryKey>;

    /// Insert several records, returning their keys in input order.
    async fn create_many(
        &self,
        collection: &str,
        data: Vec<JsonValue>,
        accountability: &Accountability,
    ) -> Result<Vec<PrimaryKey>>;

    /// Read a single record by key.
    async fn read_one(
        &self,
        collection: &str,
        key: &PrimaryKey,
        query: &Query,
        accountability: &Accountability,
    ) -> Result<JsonValue>;

    /// Read the records among `keys` that match `query`.
    async fn read_many(
        &self,
        collection: &str,
        keys: &[PrimaryKey],
        query: &Query,
        accountability: &Accountability,
    ) -> Result<Vec<JsonValue>>;

    /// Read the records matching `query`.
    async fn read_by_query(
        &self,
        collection: &str,
        query: &Query,
        accountability: &Accountability,
    ) -> Result<Vec<JsonValue>>;

    /// Apply `data` to one record.
    async fn update_one(
        &self,
        collection: &str,
        key: &PrimaryKey,
        data: JsonValue,
        accountability: &Accountability,
    ) -> Result<PrimaryKey>;

    /// Apply the same `data` to every record in `keys`.
    async fn update_many(
        &self,
        collection: &str,
        keys: &[PrimaryKey],
        data: JsonValue,
        accountability: &Accountability,
    ) -> Result<Vec<PrimaryKey>>;

    async fn delete_one(
        &self,
        collection: &str,
        key: &PrimaryKey,
        accountability: &Accountability,
    ) -> Result<()>;

    async fn delete_many(
        &self,
        collection: &str,
        keys: &[PrimaryKey],
        accountability: &Accountability,
    ) -> Result<()>;
}

// =============================================================================
// IDENTITY RESOLVER
// =============================================================================

/// Resolves accountabilities from bearer tokens and from roles.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer token. `None` resolves to the public accountability.
    async fn accountability_for_token(&self, token: Option<&str>) -> Result<Accountability>;

    /// Resolve the current permissions of `role`, carrying origin metadata
    /// over from `current`. The returned value has no user attached.
    async fn accountability_for_role(
        &self,
        role: Option<&str>,
        current: &Accountability,
    ) -> Result<Accountability>;
}

// =============================================================================
// AUTHENTICATOR
// =============================================================================

/// Token pair returned by a login or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in milliseconds.
    pub expires: i64,
}

/// Login and token refresh against the default auth provider.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<AuthTokens>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthTokens>;
}

// =============================================================================
// SCHEMA SERVICE
// =============================================================================

/// An operation submitted over the schema endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaRequest {
    pub query: String,
    #[serde(
        default,
        rename = "operationName",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<JsonValue>,
}

/// Builds and executes operations against the collection schema.
///
/// Schema construction, validation and resolver execution are owned here;
/// the gateway only carries requests and results over the socket.
#[async_trait]
pub trait SchemaService: Send + Sync {
    /// Execute `request` as `accountability`.
    ///
    /// Queries and mutations yield a single result. Subscriptions yield one
    /// result per matching event until the stream ends or is dropped. An
    /// `Err` means the operation could not start at all.
    async fn execute(
        &self,
        request: SchemaRequest,
        accountability: &Accountability,
    ) -> Result<BoxStream<'static, JsonValue>>;
}

//! Fixture loading for the development server.
//!
//! The binary serves the gateway over the in-memory collaborators from
//! `relay_core::mock`. A JSON fixture (path in `RELAY_SEED_FILE`) fills them:
//!
//! ```json
//! {
//!   "roles": [{ "name": "editor", "admin": false }],
//!   "tokens": [{ "token": "dev-token", "user": "ada", "role": "editor" }],
//!   "users": [{ "email": "ada@example.com", "password": "pw", "access_token": "dev-token" }],
//!   "grants": [{ "role": "editor", "collection": "articles", "access": "read_write" }],
//!   "collections": { "articles": [{ "id": 1, "title": "Hello" }] }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use relay_core::mock::{Access, MockAuthenticator, MockCollectionService, MockIdentityResolver};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Failed to read seed file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid seed file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedAccess {
    Read,
    ReadWrite,
}

impl From<SeedAccess> for Access {
    fn from(a: SeedAccess) -> Self {
        match a {
            SeedAccess::Read => Access::Read,
            SeedAccess::ReadWrite => Access::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRole {
    pub name: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedToken {
    pub token: String,
    pub user: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub email: String,
    pub password: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedGrant {
    /// `None` grants the public role.
    pub role: Option<String>,
    pub collection: String,
    pub access: SeedAccess,
    /// Row filter; implies read-only access.
    pub rows: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub roles: Vec<SeedRole>,
    pub tokens: Vec<SeedToken>,
    pub users: Vec<SeedUser>,
    pub grants: Vec<SeedGrant>,
    pub collections: HashMap<String, Vec<JsonValue>>,
}

impl Seed {
    pub fn from_file(path: &Path) -> Result<Self, SeedError> {
        let text = std::fs::read_to_string(path).map_err(|source| SeedError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load the fixture into the given collaborators.
    pub fn apply(
        self,
        collections: &MockCollectionService,
        identity: &MockIdentityResolver,
        authenticator: MockAuthenticator,
    ) -> MockAuthenticator {
        let mut identity = identity.clone();
        for role in &self.roles {
            identity = identity.with_role(&role.name, role.admin);
        }
        for token in &self.tokens {
            identity.add_token(&token.token, &token.user, token.role.as_deref());
        }
        for grant in &self.grants {
            match &grant.rows {
                Some(rows) => {
                    collections.grant_rows(grant.role.as_deref(), &grant.collection, rows.clone())
                }
                None => collections.grant(
                    grant.role.as_deref(),
                    &grant.collection,
                    grant.access.into(),
                ),
            }
        }
        for (name, records) in self.collections {
            collections.seed(&name, records);
        }

        let mut authenticator = authenticator;
        for user in &self.users {
            authenticator = authenticator.with_user(&user.email, &user.password, &user.access_token);
        }

        tracing::info!(
            roles = self.roles.len(),
            tokens = self.tokens.len(),
            users = self.users.len(),
            grants = self.grants.len(),
            "Seed fixture applied"
        );
        authenticator
    }
}

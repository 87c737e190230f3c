//! Effective permission identity for a connection.

use serde::{Deserialize, Serialize};

/// The effective permission context an operation is evaluated under.
///
/// Snapshots are immutable. A connection holding an accountability replaces
/// the whole value when it is refreshed, it never mutates one in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accountability {
    /// Authenticated user id. `None` for anonymous access.
    pub user: Option<String>,
    /// Role id the permissions are resolved from. `None` is the public role.
    pub role: Option<String>,
    /// Admin accountabilities bypass permission checks.
    #[serde(default)]
    pub admin: bool,
    /// Network origin of the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// User agent sent with the upgrade request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Accountability {
    /// Anonymous accountability (public role) carrying origin metadata.
    pub fn anonymous(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            user: None,
            role: None,
            admin: false,
            ip,
            user_agent,
        }
    }

    /// True when a user id is attached.
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Copy of this accountability with origin metadata filled in where missing.
    pub fn with_origin(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        if self.ip.is_none() {
            self.ip = ip;
        }
        if self.user_agent.is_none() {
            self.user_agent = user_agent;
        }
        self
    }

    /// Short label for log lines.
    pub fn label(&self) -> &str {
        self.user.as_deref().unwrap_or("public user")
    }
}

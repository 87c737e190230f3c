//! Gateway configuration.
//!
//! Configuration is read from environment variables (after `.env` loading in
//! the binary) and can be adjusted with builder-style setters.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_WS_ENABLED` | `true` | Serve the subscription endpoint |
//! | `RELAY_WS_PATH` | `/websocket` | Upgrade path |
//! | `RELAY_WS_AUTH` | `strict` | `public`, `strict` or `handshake` |
//! | `RELAY_WS_AUTH_TIMEOUT` | `10` | Handshake timeout in seconds |
//! | `RELAY_WS_PUBLIC` | `false` | Bind all interfaces instead of loopback |
//! | `RELAY_WS_HEARTBEAT_ENABLED` | `true` | Answer `PING` frames with `pong` |
//! | `RELAY_WS_IDLE_INTERVAL_MS` | unset | Server-side idle check interval |
//! | `RELAY_WS_IDLE_TIMEOUT_MS` | `5000` | Idle check timeout |
//! | `RELAY_HOST` | from `RELAY_WS_PUBLIC` | Explicit bind host |
//! | `RELAY_PORT` | `8055` | Listen port |
//! | `RELAY_EVENT_CAPACITY` | `256` | Mutation bus buffer |
//! | `RELAY_GRAPHQL_ENABLED` | `true` | Serve the schema endpoint when a schema is installed |
//! | `RELAY_GRAPHQL_PATH` | `/graphql` | Schema endpoint upgrade path |
//! | `RELAY_GRAPHQL_PUBLIC` | `true` | Admit anonymous upgrades; credentials arrive in `connection_init` |
//! | `RELAY_GRAPHQL_INIT_TIMEOUT_MS` | `3000` | Time allowed before `connection_init` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use relay_core::defaults;
use relay_core::HeartbeatConfig;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid auth mode: {0} (expected public, strict or handshake)")]
    InvalidAuthMode(String),

    #[error("Invalid path: {0} (must start with '/')")]
    InvalidPath(String),

    #[error("Schema endpoint path {0} collides with the subscription endpoint")]
    PathCollision(String),
}

/// How a connection proves who it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No credential check; connections start anonymous.
    Public,
    /// A bearer token is required before the upgrade completes.
    Strict,
    /// The upgrade completes, then the first frame must be a `HANDSHAKE`
    /// arriving within `timeout`.
    Handshake { timeout: Duration },
}

impl AuthMode {
    pub fn handshake_default() -> Self {
        AuthMode::Handshake {
            timeout: Duration::from_secs(defaults::HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Public => "public",
            AuthMode::Strict => "strict",
            AuthMode::Handshake { .. } => "handshake",
        }
    }
}

impl FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "strict" => Ok(Self::Strict),
            "handshake" => Ok(Self::handshake_default()),
            _ => Err(ConfigError::InvalidAuthMode(s.to_string())),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The second upgrade endpoint, speaking the `graphql-transport-ws`
/// protocol against an installed schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEndpointConfig {
    pub enabled: bool,
    pub path: String,
    /// When false, a bearer token is required before the upgrade completes.
    pub public: bool,
    /// Time a connection has to send `connection_init`.
    pub init_timeout: Duration,
}

impl Default for SchemaEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: defaults::GRAPHQL_PATH.to_string(),
            public: true,
            init_timeout: Duration::from_millis(defaults::GRAPHQL_INIT_TIMEOUT_MS),
        }
    }
}

impl SchemaEndpointConfig {
    /// How upgrades on this endpoint are admitted.
    pub fn auth(&self) -> AuthMode {
        if self.public {
            AuthMode::Public
        } else {
            AuthMode::Strict
        }
    }
}

/// Configuration for the subscription gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Whether the endpoint is served at all.
    pub enabled: bool,
    /// Upgrade path.
    pub path: String,
    pub auth: AuthMode,
    /// Exposure flag: bind all interfaces when true, loopback otherwise.
    pub public: bool,
    /// Register the PING/PONG handler.
    pub heartbeat_enabled: bool,
    /// Server-side idle check; disabled when `None`.
    pub idle_check: Option<HeartbeatConfig>,
    /// Explicit bind host; derived from `public` when `None`.
    pub host: Option<String>,
    pub port: u16,
    /// Mutation bus buffer capacity.
    pub event_capacity: usize,
    pub graphql: SchemaEndpointConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: defaults::WS_PATH.to_string(),
            auth: AuthMode::Strict,
            public: false,
            heartbeat_enabled: true,
            idle_check: None,
            host: None,
            port: defaults::PORT,
            event_capacity: defaults::MUTATION_BUS_CAPACITY,
            graphql: SchemaEndpointConfig::default(),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl GatewayConfig {
    /// Create config from environment variables (with defaults).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.enabled = env_flag("RELAY_WS_ENABLED", true);
        if let Ok(path) = std::env::var("RELAY_WS_PATH") {
            config = config.with_path(path)?;
        }

        config.auth = match std::env::var("RELAY_WS_AUTH") {
            Ok(mode) => mode.parse()?,
            Err(_) => AuthMode::Strict,
        };
        if let AuthMode::Handshake { .. } = config.auth {
            let secs = env_parse::<u64>("RELAY_WS_AUTH_TIMEOUT")
                .unwrap_or(defaults::HANDSHAKE_TIMEOUT_SECS);
            config.auth = AuthMode::Handshake {
                timeout: Duration::from_secs(secs),
            };
        }

        config.public = env_flag("RELAY_WS_PUBLIC", false);
        config.heartbeat_enabled = env_flag("RELAY_WS_HEARTBEAT_ENABLED", true);

        config.idle_check = match env_parse::<u64>("RELAY_WS_IDLE_INTERVAL_MS") {
            Some(interval) if interval > 0 => {
                let timeout = env_parse::<u64>("RELAY_WS_IDLE_TIMEOUT_MS")
                    .unwrap_or(defaults::CLIENT_HEARTBEAT_TIMEOUT_MS);
                Some(HeartbeatConfig::new(
                    Duration::from_millis(interval),
                    Duration::from_millis(timeout),
                ))
            }
            _ => None,
        };

        config.host = std::env::var("RELAY_HOST").ok();
        config.port = env_parse("RELAY_PORT").unwrap_or(defaults::PORT);
        config.event_capacity = env_parse::<usize>("RELAY_EVENT_CAPACITY")
            .unwrap_or(defaults::MUTATION_BUS_CAPACITY)
            .max(1);

        let mut graphql = SchemaEndpointConfig {
            enabled: env_flag("RELAY_GRAPHQL_ENABLED", true),
            public: env_flag("RELAY_GRAPHQL_PUBLIC", true),
            ..Default::default()
        };
        if let Ok(path) = std::env::var("RELAY_GRAPHQL_PATH") {
            graphql.path = path;
        }
        if let Some(ms) = env_parse::<u64>("RELAY_GRAPHQL_INIT_TIMEOUT_MS") {
            graphql.init_timeout = Duration::from_millis(ms);
        }
        config.with_graphql(graphql)
    }

    /// Set the upgrade path. Must start with `/`.
    pub fn with_path(mut self, path: impl Into<String>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidPath(path));
        }
        self.path = path;
        Ok(self)
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn with_heartbeat(mut self, enabled: bool) -> Self {
        self.heartbeat_enabled = enabled;
        self
    }

    pub fn with_idle_check(mut self, idle_check: Option<HeartbeatConfig>) -> Self {
        self.idle_check = idle_check;
        self
    }

    /// Replace the schema endpoint settings. The path must start with `/`
    /// and differ from the subscription path.
    pub fn with_graphql(mut self, graphql: SchemaEndpointConfig) -> Result<Self, ConfigError> {
        if !graphql.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(graphql.path));
        }
        if graphql.path == self.path {
            return Err(ConfigError::PathCollision(graphql.path));
        }
        self.graphql = graphql;
        Ok(self)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Host the listener binds to.
    pub fn bind_host(&self) -> &str {
        match &self.host {
            Some(host) => host,
            None if self.public => defaults::PUBLIC_HOST,
            None => defaults::HOST,
        }
    }

    /// `host:port` string for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host(), self.port)
    }
}

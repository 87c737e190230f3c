//! Connector configuration.

use std::time::Duration;

use relay_core::defaults;
use relay_core::HeartbeatConfig;
use serde_json::{json, Value as JsonValue};

/// Where the connector dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlOptions {
    /// `ws` or `wss`.
    pub protocol: String,
    /// Host and port.
    pub domain: String,
    /// Path without the leading slash.
    pub path: String,
}

impl Default for UrlOptions {
    fn default() -> Self {
        Self {
            protocol: "ws".to_string(),
            domain: defaults::CLIENT_DOMAIN.to_string(),
            path: defaults::CLIENT_PATH.to_string(),
        }
    }
}

impl UrlOptions {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn url(&self) -> String {
        format!(
            "{}://{}/{}",
            self.protocol,
            self.domain,
            self.path.trim_start_matches('/')
        )
    }
}

/// Credentials sent in the `HANDSHAKE` frame right after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeCredentials {
    AccessToken(String),
    Login { email: String, password: String },
}

impl HandshakeCredentials {
    pub fn to_frame(&self) -> JsonValue {
        match self {
            HandshakeCredentials::AccessToken(token) => {
                json!({ "type": "HANDSHAKE", "access_token": token })
            }
            HandshakeCredentials::Login { email, password } => {
                json!({ "type": "HANDSHAKE", "email": email, "password": password })
            }
        }
    }
}

/// Reconnect, queue and heartbeat behavior.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Client PING heartbeat; `None` disables it.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Sent as the first frame of every connection when set.
    pub handshake: Option<HandshakeCredentials>,
    pub max_retries: u32,
    /// Reconnect attempt `n` waits `n * base_delay`.
    pub base_delay: Duration,
    /// Pause between queued messages while draining.
    pub message_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat: Some(HeartbeatConfig::default()),
            handshake: None,
            max_retries: defaults::CLIENT_MAX_RETRIES,
            base_delay: Duration::from_millis(defaults::CLIENT_BASE_DELAY_MS),
            message_delay: Duration::from_millis(defaults::CLIENT_MESSAGE_DELAY_MS),
            request_timeout: Duration::from_millis(defaults::CLIENT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl ConnectionOptions {
    pub fn with_heartbeat(mut self, heartbeat: Option<HeartbeatConfig>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_handshake(mut self, credentials: HandshakeCredentials) -> Self {
        self.handshake = Some(credentials);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_message_delay(mut self, delay: Duration) -> Self {
        self.message_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Linear in the attempt number; `None` once the retry budget is spent.
    pub fn backoff_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        Some(self.base_delay * attempt)
    }
}

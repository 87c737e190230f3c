//! Centralized default constants for the relay gateway and connector.
//!
//! All crates reference these constants instead of defining their own magic
//! numbers. Organized by area.

// =============================================================================
// GATEWAY
// =============================================================================

/// Default upgrade path for the subscription protocol.
pub const WS_PATH: &str = "/websocket";

/// Default upgrade path for the schema endpoint.
pub const GRAPHQL_PATH: &str = "/graphql";

/// Milliseconds a schema endpoint connection has to send `connection_init`.
pub const GRAPHQL_INIT_TIMEOUT_MS: u64 = 3000;

/// Default bind host (loopback unless the endpoint is marked public).
pub const HOST: &str = "127.0.0.1";

/// Bind host used when the endpoint is marked public.
pub const PUBLIC_HOST: &str = "0.0.0.0";

/// Default listen port.
pub const PORT: u16 = 8055;

/// Seconds a handshake-mode connection has to send its HANDSHAKE frame.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Mutation bus buffer capacity.
pub const MUTATION_BUS_CAPACITY: usize = 256;

/// Gateway lifecycle event buffer capacity.
pub const GATEWAY_EVENT_CAPACITY: usize = 64;

/// Row limit of the subscription admission read.
pub const ADMISSION_READ_LIMIT: i64 = 1;

// =============================================================================
// CONNECTOR (client side)
// =============================================================================

/// Default connector domain.
pub const CLIENT_DOMAIN: &str = "localhost:8055";

/// Default connector path (no leading slash).
pub const CLIENT_PATH: &str = "websocket";

/// Reconnect attempts before the connector gives up.
pub const CLIENT_MAX_RETRIES: u32 = 5;

/// Reconnect delay unit; attempt `n` waits `n * CLIENT_BASE_DELAY_MS`.
pub const CLIENT_BASE_DELAY_MS: u64 = 200;

/// Delay between queued messages drained after (re)connecting.
pub const CLIENT_MESSAGE_DELAY_MS: u64 = 100;

/// Request/response timeout for `get()` (10 minutes).
pub const CLIENT_REQUEST_TIMEOUT_MS: u64 = 600_000;

/// Client heartbeat PING interval.
pub const CLIENT_HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Time without any inbound frame after a PING before the client closes.
pub const CLIENT_HEARTBEAT_TIMEOUT_MS: u64 = 5000;

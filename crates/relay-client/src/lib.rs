//! # relay-client
//!
//! Resilient connector for the relay subscription protocol.
//!
//! The connector keeps one WebSocket open, queues frames while it is down,
//! reconnects with a linear backoff bounded by a retry budget, and matches
//! `response` frames to outstanding [`Connector::get`] calls by correlation id.
//!
//! ```no_run
//! use relay_client::{ConnectionOptions, Connector, EventKind, UrlOptions};
//! use relay_core::Query;
//!
//! # async fn demo() -> relay_client::Result<()> {
//! let connector = Connector::init(UrlOptions::new("localhost:8055"), Some(ConnectionOptions::default()));
//! connector.on(EventKind::Message, |event| println!("{:?}", event));
//! connector.connect();
//!
//! let uid = connector.subscribe("articles", Query::default())?;
//! let rows = connector.get("articles", Query::default()).await?;
//! connector.unsubscribe(&uid);
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod connector;
pub mod error;
pub mod options;

pub use connector::{Connector, ConnectorEvent, ConnectorState, EventKind, HandlerId};
pub use error::{ClientError, Result};
pub use options::{ConnectionOptions, HandshakeCredentials, UrlOptions};

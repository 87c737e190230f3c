//! A live client connection.
//!
//! The gateway owns each [`Connection`] for its whole lifecycle. The registry
//! and the dispatcher only hold weak references, and anything that sends to a
//! connection must tolerate it having closed in the meantime.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use relay_core::{Accountability, LivenessTracker};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::frame::ServerFrame;

/// Lifecycle of a connection.
///
/// ```text
/// Pending ──► Authenticating ──► Open ──► Closed
///    │               │                      ▲
///    ▼               └──────────────────────┘
/// Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade request received, credentials not yet checked.
    Pending,
    /// Upgrade completed, waiting for the authentication step to finish.
    Authenticating,
    /// Authenticated and routing frames.
    Open,
    Closed,
    /// Refused before the upgrade completed.
    Rejected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Pending, Authenticating)
                | (Pending, Rejected)
                | (Authenticating, Open)
                | (Authenticating, Closed)
                | (Open, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Rejected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Work item for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
    /// Close frame carrying a status code and reason.
    CloseWith(u16, String),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Connection {
    id: Uuid,
    accountability: RwLock<Arc<Accountability>>,
    state: Mutex<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    liveness: LivenessTracker,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("user", &self.accountability().user)
            .finish()
    }
}

impl Connection {
    /// Create a pending connection and the receiving end of its outbound queue.
    pub fn new(accountability: Accountability) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            accountability: RwLock::new(Arc::new(accountability)),
            state: Mutex::new(ConnectionState::Pending),
            outbound: tx,
            liveness: LivenessTracker::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Snapshot of the current accountability.
    ///
    /// The value may be replaced at any await point; re-read it rather than
    /// holding a snapshot across calls.
    pub fn accountability(&self) -> Arc<Accountability> {
        self.accountability
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the accountability snapshot.
    pub fn set_accountability(&self, accountability: Accountability) {
        *self
            .accountability
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(accountability);
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Move to `next` if the edge is allowed. Returns whether it moved.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if state.can_transition_to(next) {
            tracing::trace!(connection_id = %self.id, from = %*state, to = %next, "Connection state change");
            *state = next;
            true
        } else {
            false
        }
    }

    /// Force the connection closed from whatever non-terminal state it is in.
    pub fn mark_closed(&self) -> bool {
        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Authenticating | ConnectionState::Open => {
                *state = ConnectionState::Closed;
                true
            }
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    /// Queue a frame. Returns `false`, without error, when the connection is
    /// closed or the writer has gone away.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        self.send_text(frame.to_text())
    }

    pub fn send_text(&self, text: String) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Queue a protocol-level ping.
    pub fn ping(&self) -> bool {
        self.outbound.send(Outbound::Ping).is_ok()
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Like [`Connection::close`], with a status code and reason.
    pub fn close_with(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(Outbound::CloseWith(code, reason.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use ConnectionState::*;
        assert!(Pending.can_transition_to(Authenticating));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Authenticating.can_transition_to(Open));
        assert!(Authenticating.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closed));

        assert!(!Pending.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Rejected.can_transition_to(Authenticating));
        assert!(!Open.can_transition_to(Rejected));
    }

    #[test]
    fn test_transition_rejects_invalid_edge() {
        let (conn, _rx) = Connection::new(Accountability::default());
        assert_eq!(conn.state(), ConnectionState::Pending);
        assert!(!conn.transition(ConnectionState::Open));
        assert!(conn.transition(ConnectionState::Authenticating));
        assert!(conn.transition(ConnectionState::Open));
        assert!(conn.is_open());
    }

    #[test]
    fn test_send_after_close_is_noop() {
        let (conn, mut rx) = Connection::new(Accountability::default());
        conn.transition(ConnectionState::Authenticating);
        conn.transition(ConnectionState::Open);
        assert!(conn.send(&ServerFrame::Pong));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text(r#"{"type":"pong"}"#.into()));

        assert!(conn.mark_closed());
        assert!(!conn.send(&ServerFrame::Pong));
        assert!(rx.try_recv().is_err());
        assert!(!conn.mark_closed());
    }

    #[test]
    fn test_send_with_dropped_writer() {
        let (conn, rx) = Connection::new(Accountability::default());
        drop(rx);
        assert!(!conn.send(&ServerFrame::Pong));
    }

    #[test]
    fn test_accountability_is_replaced() {
        let (conn, _rx) = Connection::new(Accountability::default());
        let before = conn.accountability();
        conn.set_accountability(Accountability {
            user: Some("u1".into()),
            ..Default::default()
        });
        assert!(before.user.is_none());
        assert_eq!(conn.accountability().user.as_deref(), Some("u1"));
    }
}

//! The resilient connector.
//!
//! One background task per physical connection owns the socket: it splits it
//! into a writer fed by an unbounded channel and a reader that resolves
//! pending `get()` requests and fans frames out to registered handlers. When
//! the socket drops, the task resets the connector to `Disconnected` and asks
//! [`Connector::reconnect`] to schedule the next attempt.
//!
//! Every `connect()` captures a generation number. [`Connector::reset`] bumps
//! it, so a task or a scheduled retry from before the reset finishes quietly
//! instead of touching the new connection.
//!
//! A completed upgrade is not yet a healthy connection: a gateway in
//! handshake mode upgrades, answers bad credentials with an `{error}` frame
//! and closes. The connection only counts as confirmed once the first
//! non-error frame arrives. Until then the retry counter keeps counting and
//! every frame written to the socket is also kept aside, so a connection that
//! dies unconfirmed puts them back at the head of the queue.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{Sink, SinkExt, Stream, StreamExt};
use relay_core::{HeartbeatConfig, LivenessTracker, Query};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::options::{ConnectionOptions, UrlOptions};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorState::Disconnected => "disconnected",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
}

/// What registered handlers observe.
#[derive(Debug)]
pub enum ConnectorEvent {
    Open,
    /// A parsed inbound frame, including `response` frames already matched
    /// to a pending `get()`.
    Message(JsonValue),
    Error(ClientError),
    Close,
}

impl ConnectorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectorEvent::Open => EventKind::Open,
            ConnectorEvent::Message(_) => EventKind::Message,
            ConnectorEvent::Error(_) => EventKind::Error,
            ConnectorEvent::Close => EventKind::Close,
        }
    }
}

/// Returned by [`Connector::on`]; pass it to [`Connector::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&ConnectorEvent) + Send + Sync>;

#[derive(Default)]
struct Outbox {
    /// Present only while a socket is open.
    sender: Option<mpsc::UnboundedSender<Message>>,
    queue: VecDeque<String>,
    /// Set while queued frames are being flushed; new sends join the queue
    /// so FIFO order holds.
    draining: bool,
    /// The open socket has delivered a non-error frame.
    confirmed: bool,
    /// Frames written to an unconfirmed socket, oldest first.
    unconfirmed: Vec<String>,
}

impl Outbox {
    /// Attach a fresh socket writer. Returns the backlog size.
    fn attach(&mut self, sender: mpsc::UnboundedSender<Message>) -> usize {
        self.sender = Some(sender);
        self.confirmed = false;
        self.unconfirmed.clear();
        self.draining = !self.queue.is_empty();
        self.queue.len()
    }

    /// Drop the socket writer. Frames the peer never acknowledged go back to
    /// the front of the queue in their original order.
    fn detach(&mut self) -> Option<mpsc::UnboundedSender<Message>> {
        self.draining = false;
        if !self.confirmed {
            let requeued = self.unconfirmed.len();
            for text in self.unconfirmed.drain(..).rev() {
                self.queue.push_front(text);
            }
            if requeued > 0 {
                debug!(requeued, "Requeued frames from unconfirmed connection");
            }
        }
        self.confirmed = false;
        self.unconfirmed.clear();
        self.sender.take()
    }

    /// Write `text` to the socket, keeping a copy while unconfirmed.
    /// Hands the text back if the writer has gone away.
    fn write(&mut self, text: String) -> std::result::Result<(), String> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(text);
        };
        let copy = (!self.confirmed).then(|| text.clone());
        match sender.send(Message::Text(text)) {
            Ok(()) => {
                if let Some(copy) = copy {
                    self.unconfirmed.push(copy);
                }
                Ok(())
            }
            Err(mpsc::error::SendError(Message::Text(returned))) => Err(returned),
            Err(_) => Ok(()),
        }
    }
}

struct Inner {
    url: UrlOptions,
    options: ConnectionOptions,
    state: watch::Sender<ConnectorState>,
    retries: AtomicU32,
    generation: AtomicU64,
    outbox: Mutex<Outbox>,
    pending: Mutex<HashMap<String, oneshot::Sender<JsonValue>>>,
    handlers: Mutex<Vec<(HandlerId, EventKind, Handler)>>,
    next_handler: AtomicU64,
}

/// Client side of the subscription protocol with reconnect, an outbound queue
/// and request/response correlation. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Default for Connector {
    fn default() -> Self {
        Self::init(UrlOptions::default(), None)
    }
}

impl Connector {
    /// Build a connector. `None` keeps the default [`ConnectionOptions`].
    pub fn init(url: UrlOptions, options: Option<ConnectionOptions>) -> Self {
        let options = options.unwrap_or_default();
        debug!(url = %url.url(), max_retries = options.max_retries, "Connector initialized");
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url,
                options,
                state,
                retries: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                outbox: Mutex::new(Outbox::default()),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
            }),
        }
    }

    pub fn url(&self) -> String {
        self.inner.url.url()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectorState {
        *self.inner.state.borrow()
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed attempts since the last confirmed connection.
    pub fn retries(&self) -> u32 {
        self.inner.retries.load(Ordering::Acquire)
    }

    /// Frames waiting for a connection.
    pub fn queued(&self) -> usize {
        lock(&self.inner.outbox).queue.len()
    }

    /// Open the socket in the background.
    ///
    /// No-op while `Connecting` or `Connected`. Must be called from within a
    /// tokio runtime.
    pub fn connect(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == ConnectorState::Disconnected {
                *state = ConnectorState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = %self.state(), "Connect ignored");
            return;
        }
        let generation = self.inner.generation.load(Ordering::Acquire);
        let connector = self.clone();
        tokio::spawn(async move { connector.run(generation).await });
    }

    /// Close any open socket and return to `Disconnected` without scheduling
    /// a retry. Queued frames and pending requests are kept.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let sender = lock(&self.inner.outbox).detach();
        if let Some(sender) = sender {
            let _ = sender.send(Message::Close(None));
        }
        self.inner.state.send_replace(ConnectorState::Disconnected);
        info!(url = %self.url(), "Connector reset");
    }

    /// Schedule the next connection attempt after the backoff delay.
    ///
    /// Returns `false` when a connection is live or in progress, or when the
    /// retry budget is spent. In the latter case outstanding `get()` calls
    /// fail with [`ClientError::Closed`].
    pub fn reconnect(&self) -> bool {
        if self.state() != ConnectorState::Disconnected {
            warn!(state = %self.state(), "There seems to be an open connection, not reconnecting");
            return false;
        }
        let attempt = self.retries() + 1;
        let Some(delay) = self.inner.options.backoff_delay(attempt) else {
            warn!(
                max_retries = self.inner.options.max_retries,
                "Retry budget exhausted, giving up"
            );
            lock(&self.inner.pending).clear();
            return false;
        };
        self.inner.retries.store(attempt, Ordering::Release);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

        let generation = self.inner.generation.load(Ordering::Acquire);
        let connector = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !connector.is_stale(generation) {
                connector.connect();
            }
        });
        true
    }

    /// Send a JSON-serializable frame, or queue it until connected.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.send_text(text);
        Ok(())
    }

    /// Send raw text, or queue it until connected.
    pub fn send_text(&self, text: impl Into<String>) {
        let mut text = text.into();
        let mut outbox = lock(&self.inner.outbox);
        if !outbox.draining && outbox.sender.is_some() {
            match outbox.write(text) {
                Ok(()) => {
                    trace!("Frame sent");
                    return;
                }
                Err(returned) => text = returned,
            }
        }
        trace!(queued = outbox.queue.len() + 1, "Frame queued");
        outbox.queue.push_back(text);
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ConnectorEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        lock(&self.inner.handlers).push((id, kind, handler));
        id
    }

    /// Returns `false` if the handler was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|(h, _, _)| *h != id);
        handlers.len() != before
    }

    /// Read `collection` with `query` and wait for the correlated `response`.
    pub async fn get(&self, collection: &str, query: Query) -> Result<JsonValue> {
        let uid = Uuid::new_v4().to_string();
        let query = serde_json::to_value(&query)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(uid.clone(), tx);
        self.send_text(
            json!({ "type": "GET", "uid": uid, "collection": collection, "query": query })
                .to_string(),
        );

        let timeout = self.inner.options.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                lock(&self.inner.pending).remove(&uid);
                debug!(uid = %uid, collection, "Request timed out");
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Subscribe to `collection`; returns the id to pass to `unsubscribe`.
    pub fn subscribe(&self, collection: &str, query: Query) -> Result<String> {
        let uid = Uuid::new_v4().to_string();
        let query = serde_json::to_value(&query)?;
        self.send_text(
            json!({ "type": "SUBSCRIBE", "collection": collection, "query": query, "uid": uid })
                .to_string(),
        );
        Ok(uid)
    }

    pub fn unsubscribe(&self, uid: &str) {
        self.send_text(json!({ "type": "UNSUBSCRIBE", "uid": uid }).to_string());
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::Acquire) != generation
    }

    async fn run(self, generation: u64) {
        let url = self.url();
        info!(url = %url, "Connecting");
        let error = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                if self.is_stale(generation) {
                    let _ = ws.close(None).await;
                    return;
                }
                self.serve(ws, generation).await
            }
            Err(e) => Some(ClientError::from(e)),
        };
        if self.is_stale(generation) {
            return;
        }

        lock(&self.inner.outbox).detach();
        self.inner.state.send_replace(ConnectorState::Disconnected);
        if let Some(err) = error {
            warn!(url = %url, error = %err, "Connection error");
            self.emit(ConnectorEvent::Error(err));
        }
        info!(url = %url, "Connection closed");
        self.emit(ConnectorEvent::Close);
        self.reconnect();
    }

    /// Drive one open socket until it closes. Returns the transport error, if any.
    async fn serve<W>(&self, ws: W, generation: u64) -> Option<ClientError>
    where
        W: Stream<Item = std::result::Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Send
            + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Exits once every sender is dropped or after writing a close frame.
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "Write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        if let Some(credentials) = &self.inner.options.handshake {
            let _ = tx.send(Message::Text(credentials.to_frame().to_string()));
        }
        let backlog = lock(&self.inner.outbox).attach(tx.clone());
        self.inner.state.send_replace(ConnectorState::Connected);
        info!(url = %self.url(), backlog, "Connected");
        self.emit(ConnectorEvent::Open);

        let drain = (backlog > 0).then(|| tokio::spawn(self.clone().drain()));
        let liveness = Arc::new(LivenessTracker::new());
        let mut heartbeat = self
            .inner
            .options
            .heartbeat
            .map(|config| tokio::spawn(heartbeat(tx.clone(), liveness.clone(), config)));
        drop(tx);

        let mut error = None;
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        liveness.touch();
                        if self.handle_text(&text) {
                            self.confirm(generation);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        liveness.touch();
                        self.confirm(generation);
                    }
                    Some(Err(e)) => {
                        error = Some(ClientError::from(e));
                        break;
                    }
                },
                _ = expired(&mut heartbeat) => break,
            }
        }

        if let Some(task) = drain {
            task.abort();
        }
        if let Some(task) = heartbeat {
            task.abort();
        }
        error
    }

    /// The peer answered with something other than an error: reset the
    /// retry budget and stop keeping copies of written frames.
    fn confirm(&self, generation: u64) {
        if self.is_stale(generation) {
            return;
        }
        let mut outbox = lock(&self.inner.outbox);
        if outbox.confirmed || outbox.sender.is_none() {
            return;
        }
        outbox.confirmed = true;
        outbox.unconfirmed.clear();
        drop(outbox);
        let retries = self.inner.retries.swap(0, Ordering::AcqRel);
        debug!(url = %self.url(), retries, "Connection confirmed");
    }

    /// Flush queued frames in order, pausing `message_delay` between them.
    async fn drain(self) {
        let delay = self.inner.options.message_delay;
        loop {
            {
                let mut outbox = lock(&self.inner.outbox);
                if outbox.sender.is_none() {
                    outbox.draining = false;
                    return;
                }
                let Some(text) = outbox.queue.pop_front() else {
                    outbox.draining = false;
                    return;
                };
                if let Err(text) = outbox.write(text) {
                    outbox.queue.push_front(text);
                    outbox.draining = false;
                    return;
                }
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Returns `true` for a well-formed frame that is not an `{error}` frame.
    fn handle_text(&self, text: &str) -> bool {
        trace!(len = text.len(), "Frame received");
        let frame: JsonValue = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Unparsable frame");
                self.emit(ConnectorEvent::Error(e.into()));
                return false;
            }
        };
        let healthy = frame.get("error").is_none();
        self.resolve_pending(&frame);
        self.emit(ConnectorEvent::Message(frame));
        healthy
    }

    fn resolve_pending(&self, frame: &JsonValue) {
        let is_response = frame
            .get("type")
            .and_then(JsonValue::as_str)
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("response"));
        if !is_response {
            return;
        }
        let uid = match frame.get("uid") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return,
        };
        let waiter = lock(&self.inner.pending).remove(&uid);
        if let Some(waiter) = waiter {
            let data = frame.get("data").cloned().unwrap_or(JsonValue::Null);
            let _ = waiter.send(data);
        }
    }

    fn emit(&self, event: ConnectorEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = lock(&self.inner.handlers)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }
}

/// PING every interval; give up when nothing at all arrives within the timeout.
async fn heartbeat(
    tx: mpsc::UnboundedSender<Message>,
    liveness: Arc<LivenessTracker>,
    config: HeartbeatConfig,
) {
    let ping = json!({ "type": "PING" }).to_string();
    loop {
        tokio::time::sleep(config.interval).await;
        let mark = liveness.seen();
        if tx.send(Message::Text(ping.clone())).is_err() {
            return;
        }
        if !liveness.wait_for_traffic(mark, config.timeout).await {
            warn!(
                timeout_ms = config.timeout.as_millis() as u64,
                "Heartbeat timed out, closing"
            );
            let _ = tx.send(Message::Close(None));
            return;
        }
    }
}

/// Resolves when the heartbeat task gives up; never without one.
async fn expired(task: &mut Option<JoinHandle<()>>) {
    match task {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending().await,
    }
}

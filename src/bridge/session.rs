//! SSE session registry.
//!
//! Maps an opaque, client-chosen session id to the live event stream opened
//! by `GET /events?sessionId=…`. The registry holds only the send half of
//! each stream; the HTTP response body owns the receive half, so a session
//! lives exactly as long as its connection:
//!
//! - client disconnect or a failed socket write drops the body, whose
//!   [`SessionStream`] guard deregisters the session;
//! - a failed or backlogged send from the bridge removes the session, which
//!   ends the stream;
//! - a reconnect under the same id replaces the old entry, and the stale
//!   stream ends because its sender is gone.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Data of the `connected` event sent first on every stream.
pub const CONNECTED_DATA: &str = r#"{"status":"connected"}"#;

/// One event queued for an SSE stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `event: connected` greeting.
    Connected,
    /// `data:` event carrying one JSON-RPC message.
    Message(String),
}

impl SseFrame {
    /// Render as an axum SSE event.
    #[must_use]
    pub fn into_event(self) -> Event {
        match self {
            Self::Connected => Event::default().event("connected").data(CONNECTED_DATA),
            Self::Message(payload) => Event::default().data(payload),
        }
    }
}

/// Registry entry for one open stream.
#[derive(Debug)]
struct SseSession {
    connection_id: Uuid,
    tx: mpsc::Sender<SseFrame>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, SseSession>,
    closed: bool,
}

/// Read-only view of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Client-chosen session id.
    pub session_id: String,
    /// Identifies the connection currently bound to the id.
    pub connection_id: Uuid,
    /// When the current connection was opened.
    pub connected_at: DateTime<Utc>,
    /// Last successful enqueue on the stream.
    pub last_activity: DateTime<Utc>,
}

/// Thread-safe map of session id to open SSE stream.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    buffer: usize,
}

impl SessionRegistry {
    /// Create a registry whose streams queue up to `buffer` frames each.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new stream for `session_id`, replacing any previous one.
    ///
    /// The returned stream yields [`SseFrame::Connected`] first. After
    /// [`close_all`](Self::close_all) the stream ends right after that
    /// greeting.
    #[must_use]
    pub fn connect(self: &Arc<Self>, session_id: impl Into<String>) -> SessionStream {
        let session_id = session_id.into();
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);

        // Fresh channel with capacity >= 1; cannot fail.
        let _ = tx.try_send(SseFrame::Connected);

        let now = Utc::now();
        let mut inner = self.lock();
        if inner.closed {
            debug!(session_id, "sse connect after shutdown; closing immediately");
        } else {
            let previous = inner.sessions.insert(
                session_id.clone(),
                SseSession {
                    connection_id,
                    tx,
                    connected_at: now,
                    last_activity: now,
                },
            );
            if let Some(old) = previous {
                info!(
                    session_id,
                    replaced = %old.connection_id,
                    "sse session reconnected; previous stream closed"
                );
            } else {
                info!(session_id, %connection_id, "sse session connected");
            }
        }
        drop(inner);

        SessionStream {
            rx,
            registry: Arc::downgrade(self),
            session_id,
            connection_id,
        }
    }

    /// Look up the session bound to `session_id`.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|session| SessionHandle {
                session_id: session_id.to_owned(),
                connection_id: session.connection_id,
                connected_at: session.connected_at,
                last_activity: session.last_activity,
            })
    }

    /// Whether a stream is registered for `session_id`.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// Remove `session_id`, ending its stream. Returns whether it existed.
    pub fn disconnect(&self, session_id: &str) -> bool {
        let removed = self.lock().sessions.remove(session_id).is_some();
        if removed {
            info!(session_id, "sse session disconnected");
        }
        removed
    }

    /// Remove `session_id` only while it is still bound to `connection_id`.
    fn release(&self, session_id: &str, connection_id: Uuid) {
        let mut inner = self.lock();
        let current = inner
            .sessions
            .get(session_id)
            .is_some_and(|session| session.connection_id == connection_id);
        if current {
            inner.sessions.remove(session_id);
            drop(inner);
            info!(session_id, %connection_id, "sse stream closed; session removed");
        }
    }

    /// Queue `payload` as a `data:` event on `session_id`'s stream.
    ///
    /// Returns `false` when no stream is registered or the enqueue failed.
    /// A failed enqueue (receiver gone or queue full) removes the session.
    pub fn send(&self, session_id: &str, payload: String) -> bool {
        let mut inner = self.lock();
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return false;
        };

        match session.tx.try_send(SseFrame::Message(payload)) {
            Ok(()) => {
                session.last_activity = Utc::now();
                true
            }
            Err(err) => {
                inner.sessions.remove(session_id);
                drop(inner);
                match err {
                    TrySendError::Full(_) => {
                        warn!(session_id, "sse stream backlogged; session dropped");
                    }
                    TrySendError::Closed(_) => {
                        debug!(session_id, "sse stream already closed; session dropped");
                    }
                }
                false
            }
        }
    }

    /// Queue `payload` on every registered stream.
    ///
    /// Returns how many streams accepted it; failing streams are removed.
    pub fn broadcast(&self, payload: &str) -> usize {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut failed = Vec::new();
        let mut delivered = 0;

        for (session_id, session) in &mut inner.sessions {
            if session
                .tx
                .try_send(SseFrame::Message(payload.to_owned()))
                .is_ok()
            {
                session.last_activity = now;
                delivered += 1;
            } else {
                failed.push(session_id.clone());
            }
        }

        for session_id in &failed {
            inner.sessions.remove(session_id);
        }
        drop(inner);

        if !failed.is_empty() {
            warn!(dropped = failed.len(), "sse streams failed during broadcast");
        }
        delivered
    }

    /// Close every stream and refuse new ones. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let count = inner.sessions.len();
        inner.sessions.clear();
        count
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receive half of one SSE connection.
///
/// Dropping it (the HTTP body went away) deregisters the session, unless a
/// newer connection has taken over the id.
#[derive(Debug)]
pub struct SessionStream {
    rx: mpsc::Receiver<SseFrame>,
    registry: Weak<SessionRegistry>,
    session_id: String,
    connection_id: Uuid,
}

impl SessionStream {
    /// Session id this stream serves.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Connection id assigned at connect time.
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

impl Stream for SessionStream {
    type Item = SseFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.session_id, self.connection_id);
        }
    }
}

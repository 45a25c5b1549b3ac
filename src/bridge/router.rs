//! Response router: demultiplexes the child's stdout onto waiting requests.
//!
//! Every POST that expects an answer registers its id here before the
//! request line is written to the child. A single consumer task reads the
//! child's stdout line by line and, for each JSON-RPC response, removes the
//! matching registration and hands the line to its waiter. Responses may
//! arrive in any order; each one reaches the request that carries its id.
//!
//! | stdout line                         | outcome                                |
//! |-------------------------------------|----------------------------------------|
//! | blank                               | [`RouteOutcome::Ignored`]              |
//! | not JSON                            | [`RouteOutcome::Malformed`], logged    |
//! | has `method` (child-initiated)      | [`RouteOutcome::Broadcast`] to SSE     |
//! | `id` matches a registration         | [`RouteOutcome::Delivered`]            |
//! | anything else                       | [`RouteOutcome::Orphan`], logged       |
//!
//! The registration table sits behind one mutex. Delivery, timeout and
//! cancellation all resolve a request by removing its entry under that lock,
//! so exactly one of them wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rpc::RequestId;
use super::session::SessionRegistry;
use crate::child::codec::Frame;
use crate::{AppError, Result};

/// Longest stdout excerpt copied into a log event.
const LOG_EXCERPT_BYTES: usize = 256;

/// Where a response should go once it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// Back through the originating POST's HTTP response.
    Direct,
    /// Onto the SSE stream registered under this session id, falling back to
    /// the POST response if that stream is gone by delivery time.
    Session(String),
}

/// What the originating POST receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The child's response line, to be returned as the HTTP body.
    Response(String),
    /// The response went out over SSE; the POST answers `{"status":"ok"}`.
    Acknowledged,
}

/// Result of routing one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The line reached the waiter registered for this id.
    Delivered(RequestId),
    /// The line had no registered waiter.
    Orphan(Option<RequestId>),
    /// The line was not valid JSON.
    Malformed,
    /// A child-initiated message, fanned out to this many SSE streams.
    Broadcast(usize),
    /// Blank line.
    Ignored,
}

type Reply = oneshot::Sender<Result<Delivery>>;

#[derive(Debug)]
struct PendingRequest {
    target: DeliveryTarget,
    reply: Reply,
    registered_at: Instant,
}

#[derive(Debug, Default)]
struct Table {
    pending: HashMap<RequestId, PendingRequest>,
    /// Set once the child's stdout is gone; later registrations fail.
    closed: Option<String>,
}

/// Claim on a future response, returned by [`ResponseRouter::register`].
///
/// Until it is resolved by [`ResponseRouter::wait`], dropping the ticket
/// cancels its registration and frees the id. This covers a POST abandoned
/// while its line is still being written to the child.
#[derive(Debug)]
pub struct Ticket {
    id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Delivery>>,
    router: Weak<ResponseRouter>,
    resolved: bool,
}

impl Ticket {
    /// Id this ticket waits for.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Instant after which the request times out.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            if router.cancel(&self.id) {
                debug!(id = %self.id, "request abandoned, registration cancelled");
            }
        }
    }
}

/// Correlates child responses with pending requests.
#[derive(Debug)]
pub struct ResponseRouter {
    table: Mutex<Table>,
    sessions: Arc<SessionRegistry>,
}

impl ResponseRouter {
    /// Create a router that delivers session-targeted responses via `sessions`.
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`, due within `timeout`.
    ///
    /// # Errors
    ///
    /// - [`AppError::DuplicateId`] if `id` is already pending.
    /// - [`AppError::ChildUnavailable`] once the child's stdout has closed.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        target: DeliveryTarget,
        timeout: Duration,
    ) -> Result<Ticket> {
        let (reply, rx) = oneshot::channel();
        let now = Instant::now();

        let mut table = self.lock();
        if let Some(ref reason) = table.closed {
            return Err(AppError::ChildUnavailable(reason.clone()));
        }
        if table.pending.contains_key(&id) {
            return Err(AppError::DuplicateId(format!(
                "request id {id} is already pending"
            )));
        }
        table.pending.insert(
            id.clone(),
            PendingRequest {
                target,
                reply,
                registered_at: now,
            },
        );
        drop(table);

        debug!(%id, "request registered");
        Ok(Ticket {
            id,
            deadline: now + timeout,
            rx,
            router: Arc::downgrade(self),
            resolved: false,
        })
    }

    /// Remove `id` without notifying its waiter.
    ///
    /// Returns `false` if the entry was already resolved.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    /// Wait for the response `ticket` was issued for.
    ///
    /// If the deadline passes first the registration is cancelled. Should a
    /// delivery win that race, its result is returned instead. Dropping the
    /// returned future drops the ticket, which also cancels the registration.
    ///
    /// # Errors
    ///
    /// - [`AppError::ResponseTimeout`] if the deadline elapsed.
    /// - [`AppError::ChildUnavailable`] if the child went away first.
    pub async fn wait(&self, mut ticket: Ticket) -> Result<Delivery> {
        let outcome = match tokio::time::timeout_at(ticket.deadline, &mut ticket.rx).await {
            Ok(delivered) => delivered.unwrap_or_else(|_| Err(router_stopped())),
            Err(_elapsed) => {
                if self.cancel(&ticket.id) {
                    warn!(id = %ticket.id, "no response from child before deadline");
                    Err(timed_out(&ticket.id))
                } else {
                    // Lost the race: the entry was taken for delivery.
                    (&mut ticket.rx).await.unwrap_or_else(|_| Err(router_stopped()))
                }
            }
        };

        ticket.resolved = true;
        outcome
    }

    /// Route one stdout line to its waiter.
    pub fn route_line(&self, line: &str) -> RouteOutcome {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return RouteOutcome::Ignored;
        }

        let message: Value = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    error = %err,
                    raw_line = excerpt(trimmed),
                    "malformed child output, discarding line"
                );
                return RouteOutcome::Malformed;
            }
        };

        if message.get("method").is_some() {
            let receivers = self.sessions.broadcast(trimmed);
            debug!(receivers, "child-initiated message broadcast to sse sessions");
            return RouteOutcome::Broadcast(receivers);
        }

        let Some(id) = message.get("id").and_then(RequestId::from_value) else {
            warn!(raw_line = excerpt(trimmed), "orphan response without usable id");
            return RouteOutcome::Orphan(None);
        };

        let Some(pending) = self.lock().pending.remove(&id) else {
            warn!(%id, "orphan response, no pending request");
            return RouteOutcome::Orphan(Some(id));
        };

        self.deliver(&id, pending, trimmed.to_owned());
        RouteOutcome::Delivered(id)
    }

    fn deliver(&self, id: &RequestId, pending: PendingRequest, line: String) {
        let delivery = match pending.target {
            DeliveryTarget::Direct => Delivery::Response(line),
            DeliveryTarget::Session(ref session_id) => {
                if self.sessions.send(session_id, line.clone()) {
                    Delivery::Acknowledged
                } else {
                    debug!(%id, session_id, "sse session unavailable, replying on the post");
                    Delivery::Response(line)
                }
            }
        };

        let elapsed_ms =
            u64::try_from(pending.registered_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        if pending.reply.send(Ok(delivery)).is_err() {
            debug!(%id, "waiter went away before delivery");
        } else {
            debug!(%id, elapsed_ms, "response delivered");
        }
    }

    /// Fail every pending request with `ChildUnavailable` and refuse new ones.
    ///
    /// Returns the number of requests failed.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = {
            let mut table = self.lock();
            table.closed.get_or_insert_with(|| reason.to_owned());
            table.pending.drain().collect()
        };

        let count = drained.len();
        for (id, pending) in drained {
            if pending
                .reply
                .send(Err(AppError::ChildUnavailable(reason.to_owned())))
                .is_err()
            {
                debug!(%id, "waiter went away before failure notice");
            }
        }
        count
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Consume the child's stdout until it ends or `cancel` fires.
    ///
    /// Malformed, oversized, and orphan lines are logged and skipped. When
    /// the loop ends every pending request fails with `ChildUnavailable`
    /// right away rather than waiting out its deadline.
    pub async fn run<S>(&self, mut lines: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Frame>> + Unpin,
    {
        let reason = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("response router: cancellation received, stopping");
                    break "bridge shutting down".to_owned();
                }

                item = lines.next() => match item {
                    None => {
                        info!("response router: child stdout closed");
                        break "child process exited".to_owned();
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "response router: stdout read failed, stopping");
                        break format!("child stdout failed: {err}");
                    }
                    Some(Ok(Frame::Discarded)) => {
                        warn!("response router: oversized stdout line discarded");
                    }
                    Some(Ok(Frame::Line(line))) => {
                        self.route_line(&line);
                    }
                },
            }
        };

        let failed = self.close(&reason);
        if failed > 0 {
            warn!(failed, %reason, "pending requests failed");
        }
    }
}

fn timed_out(id: &RequestId) -> AppError {
    AppError::ResponseTimeout(format!("no response for id {id} before deadline"))
}

fn router_stopped() -> AppError {
    AppError::ChildUnavailable("response router stopped".into())
}

fn excerpt(line: &str) -> &str {
    if line.len() <= LOG_EXCERPT_BYTES {
        return line;
    }
    let mut end = LOG_EXCERPT_BYTES;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

//! HTTP/SSE surface of the bridge.
//!
//! | Method/Path                  | Behavior                                          |
//! |------------------------------|---------------------------------------------------|
//! | `OPTIONS *`                  | 200, CORS headers, empty body                     |
//! | `GET /events?sessionId=<id>` | SSE stream for that session                       |
//! | `POST /message`              | JSON-RPC request forwarded to the child           |
//! | anything else                | 404, empty body                                   |
//!
//! Every response carries the CORS headers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::{Delivery, DeliveryTarget, ResponseRouter};
use super::rpc::{parse_request, RpcFailure};
use super::session::SessionRegistry;
use crate::child::ChildChannel;
use crate::config::BridgeConfig;
use crate::{AppError, Result};

/// Shared bridge context handed to every request handler.
#[derive(Debug)]
pub struct Bridge {
    /// Bridge configuration.
    pub config: Arc<BridgeConfig>,
    /// Send side of the child's stdin.
    pub channel: ChildChannel,
    /// Pending-request table and stdout consumer.
    pub router: Arc<ResponseRouter>,
    /// Open SSE streams.
    pub sessions: Arc<SessionRegistry>,
}

/// Background tasks started by [`Bridge::start`].
#[derive(Debug)]
pub struct BridgeTasks {
    /// Child stdin writer.
    pub writer: JoinHandle<Result<()>>,
    /// Child stdout consumer.
    pub router: JoinHandle<()>,
}

impl Bridge {
    /// Build the bridge over a child's stdin and stdout.
    ///
    /// Spawns the writer and the response router; both stop when `cancel`
    /// fires, at which point pending requests fail with `ChildUnavailable`.
    #[must_use]
    pub fn start<W, R>(
        config: Arc<BridgeConfig>,
        stdin: W,
        stdout: R,
        cancel: &CancellationToken,
    ) -> (Arc<Self>, BridgeTasks)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sessions = Arc::new(SessionRegistry::new(config.session_buffer));
        let router = Arc::new(ResponseRouter::new(Arc::clone(&sessions)));
        let (channel, lines, writer) = ChildChannel::open(stdin, stdout, cancel.child_token());

        let router_task = {
            let router = Arc::clone(&router);
            let ct = cancel.child_token();
            tokio::spawn(async move { router.run(lines, ct).await })
        };

        let bridge = Arc::new(Self {
            config,
            channel,
            router,
            sessions,
        });

        (
            bridge,
            BridgeTasks {
                writer,
                router: router_task,
            },
        )
    }
}

/// Query string accepted by `/message` and `/events`.
#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

impl SessionQuery {
    fn session_id(self) -> Option<String> {
        self.session_id.filter(|id| !id.is_empty())
    }
}

/// Build the axum router for `bridge`.
#[must_use]
pub fn app(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/message", post(post_message).fallback(not_found))
        .route("/events", get(open_events).fallback(not_found))
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .with_state(bridge)
}

/// Serve `bridge` on `listener` until `cancel` fires.
///
/// On cancellation the listener stops accepting, every SSE stream is closed,
/// and the call returns once in-flight requests finish.
///
/// # Errors
///
/// Returns `AppError::Server` if the HTTP server fails.
pub async fn serve(
    bridge: Arc<Bridge>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Server(format!("listener has no local address: {err}")))?;
    let sessions = Arc::clone(&bridge.sessions);

    info!(%addr, "bridge listening");

    axum::serve(listener, app(bridge))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            let closed = sessions.close_all();
            info!(closed, "shutdown: sse streams closed");
        })
        .await
        .map_err(|err| AppError::Server(format!("http server error: {err}")))?;

    info!("bridge http server shut down");
    Ok(())
}

/// `POST /message`: forward one JSON-RPC request to the child.
async fn post_message(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> std::result::Result<Response, RpcFailure> {
    let request = parse_request(&body).inspect_err(|failure| {
        debug!(error = %failure.error, "rejected malformed request");
    })?;

    let Some(id) = request.id else {
        let deadline = Instant::now() + bridge.config.response_timeout();
        match tokio::time::timeout_at(deadline, bridge.channel.send(&request.line)).await {
            Ok(sent) => sent.map_err(|err| RpcFailure::new(err, Value::Null))?,
            Err(_elapsed) => {
                warn!(method = %request.method, "child did not accept notification before deadline");
                return Err(RpcFailure::new(
                    AppError::ResponseTimeout("child stdin not writable before deadline".into()),
                    Value::Null,
                ));
            }
        }
        debug!(method = %request.method, "notification forwarded");
        return Ok(acknowledged());
    };

    let echo = id.to_value();
    let target = query
        .session_id()
        .map_or(DeliveryTarget::Direct, DeliveryTarget::Session);

    // Dropping the ticket from here on (client gone, early return) frees the id.
    let ticket = bridge
        .router
        .register(id.clone(), target, bridge.config.response_timeout())
        .map_err(|err| {
            warn!(%id, error = %err, "request not registered");
            RpcFailure::new(err, echo.clone())
        })?;

    match tokio::time::timeout_at(ticket.deadline(), bridge.channel.send(&request.line)).await {
        Ok(Ok(())) => debug!(%id, method = %request.method, "request dispatched"),
        Ok(Err(err)) => {
            warn!(%id, error = %err, "failed to write request to child");
            return Err(RpcFailure::new(err, echo));
        }
        Err(_elapsed) => {
            // Past the deadline, so this resolves at once: a timeout, or
            // whatever the router settled first.
            warn!(%id, "child did not accept request before deadline");
        }
    }

    match bridge.router.wait(ticket).await {
        Ok(Delivery::Response(line)) => {
            Ok(([(CONTENT_TYPE, "application/json")], line).into_response())
        }
        Ok(Delivery::Acknowledged) => Ok(acknowledged()),
        Err(err) => Err(RpcFailure::new(err, echo)),
    }
}

/// `GET /events`: open the SSE stream for `sessionId`.
async fn open_events(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session_id) = query.session_id() else {
        return (
            StatusCode::BAD_REQUEST,
            "sessionId query parameter is required",
        )
            .into_response();
    };

    let stream = bridge
        .sessions
        .connect(session_id)
        .map(|frame| Ok::<_, Infallible>(frame.into_event()));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(bridge.config.keepalive_interval()))
        .into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn acknowledged() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// Answer preflights directly and stamp CORS headers on everything else.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

//! The HTTP/SSE to stdio bridge.
//!
//! - `rpc`: JSON-RPC envelope validation and error envelopes.
//! - `router`: correlates child responses with pending requests.
//! - `session`: registry of open SSE streams.
//! - `server`: axum routes and the shared [`Bridge`](server::Bridge) context.

pub mod router;
pub mod rpc;
pub mod server;
pub mod session;

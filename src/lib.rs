#![forbid(unsafe_code)]

//! Bridge a line-delimited JSON-RPC child process to HTTP and SSE clients.

pub mod bridge;
pub mod child;
pub mod config;
pub mod errors;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};

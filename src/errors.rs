//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all bridge failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Framing or protocol failure on the child's stdio streams.
    Child(String),
    /// The child process has exited or its stdin pipe is broken.
    ChildUnavailable(String),
    /// Request body is not valid JSON.
    Parse(String),
    /// Request body is JSON but not a valid JSON-RPC 2.0 request.
    InvalidRequest(String),
    /// A request with the same id is already awaiting a response.
    DuplicateId(String),
    /// No response arrived from the child before the deadline.
    ResponseTimeout(String),
    /// HTTP listener or server failure.
    Server(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Child(msg) => write!(f, "child: {msg}"),
            Self::ChildUnavailable(msg) => write!(f, "child unavailable: {msg}"),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::DuplicateId(msg) => write!(f, "duplicate id: {msg}"),
            Self::ResponseTimeout(msg) => write!(f, "response timeout: {msg}"),
            Self::Server(msg) => write!(f, "server: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

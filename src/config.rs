//! Bridge configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// How the child JSON-RPC process is launched.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChildConfig {
    /// Executable to run (resolved through `PATH`).
    #[serde(default = "default_child_command")]
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default = "default_child_args")]
    pub args: Vec<String>,
    /// Working directory for the child; inherits the bridge's when absent.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables layered on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            command: default_child_command(),
            args: default_child_args(),
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

fn default_child_command() -> String {
    "node".into()
}

fn default_child_args() -> Vec<String> {
    vec!["build/index.js".into()]
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    6278
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_keepalive_seconds() -> u64 {
    15
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_session_buffer() -> usize {
    64
}

/// Bridge configuration parsed from `bridge.toml`.
///
/// Every key is optional; an empty file yields [`BridgeConfig::default`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Port the HTTP listener binds to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a POST waits for the child's response before a 504.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Interval between SSE keepalive comments.
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u64,
    /// Upper bound on shutdown of the child and the HTTP server.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Frames queued per SSE stream before a write counts as failed.
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,
    /// Child process launch settings.
    #[serde(default)]
    pub child: ChildConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            keepalive_seconds: default_keepalive_seconds(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            session_buffer: default_session_buffer(),
            child: ChildConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address for the HTTP listener.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Response wait budget before a request is answered with 504.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interval between SSE keepalive comments.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_seconds)
    }

    /// Grace period for shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(AppError::Config(
                "timeout_ms must be greater than zero".into(),
            ));
        }

        if self.keepalive_seconds == 0 {
            return Err(AppError::Config(
                "keepalive_seconds must be greater than zero".into(),
            ));
        }

        if self.session_buffer == 0 {
            return Err(AppError::Config(
                "session_buffer must be greater than zero".into(),
            ));
        }

        if self.child.command.trim().is_empty() {
            return Err(AppError::Config("child.command must not be empty".into()));
        }

        Ok(())
    }
}

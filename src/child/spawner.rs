//! Child process spawner.
//!
//! Launches the JSON-RPC child with all three stdio streams piped and
//! `kill_on_drop(true)` so a bridge that unwinds never leaks the process.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChildConfig;
use crate::{AppError, Result};

/// A freshly spawned child with its pipes detached from the handle.
///
/// The caller is responsible for:
/// - Handing `child` to the supervisor (it has `kill_on_drop(true)`).
/// - Opening a [`ChildChannel`](super::ChildChannel) over `stdin`/`stdout`.
/// - Draining `stderr` so the child never blocks on a full pipe.
#[derive(Debug)]
pub struct ChildProcess {
    /// Process handle.
    pub child: Child,
    /// Child's stdin; JSON-RPC requests go here.
    pub stdin: ChildStdin,
    /// Child's stdout; JSON-RPC responses come from here.
    pub stdout: ChildStdout,
    /// Child's stderr; diagnostics only.
    pub stderr: ChildStderr,
}

/// Spawn the child described by `config`.
///
/// # Errors
///
/// - `AppError::Child("failed to spawn …")` on OS spawn failure.
/// - `AppError::Child("failed to capture …")` if a pipe is missing.
pub fn spawn_child(config: &ChildConfig) -> Result<ChildProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Child(format!("failed to spawn `{}`: {err}", config.command))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Child("failed to capture child stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Child("failed to capture child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Child("failed to capture child stderr".into()))?;

    info!(
        command = %config.command,
        args = ?config.args,
        pid = child.id(),
        "child process spawned"
    );

    Ok(ChildProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Forward the child's stderr to the log, one event per line.
///
/// Lines are never parsed. The task ends at EOF, on a read error, or when
/// `cancel` fires.
#[must_use]
pub fn drain_stderr<R>(stderr: R, cancel: CancellationToken) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = lines.next_line() => match next {
                    Ok(Some(line)) => {
                        info!(target: "child_stderr", "{line}");
                    }
                    Ok(None) => {
                        debug!("child stderr closed");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "failed to read child stderr");
                        break;
                    }
                },
            }
        }
    })
}

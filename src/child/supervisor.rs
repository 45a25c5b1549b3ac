//! Child process supervisor.
//!
//! Owns the child's process handle for the bridge's lifetime. It reports an
//! unexpected exit to whoever awaits its join handle, and on shutdown asks
//! the child to stop (SIGTERM on unix) before killing it once the grace
//! period runs out. Restarting a crashed child is left to the process
//! manager running the bridge.

use std::time::Duration;

use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How the supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildExit {
    /// The child exited on its own while the bridge was still running.
    Unexpected {
        /// Exit code, absent when killed by a signal or unknown.
        code: Option<i32>,
        /// Human-readable description of the exit.
        reason: String,
    },
    /// The child was stopped as part of bridge shutdown.
    Stopped,
}

/// Spawn the supervisor task for `child`.
///
/// The task completes with [`ChildExit::Unexpected`] as soon as the child
/// exits, or with [`ChildExit::Stopped`] once `shutdown` fires and the child
/// is gone.
#[must_use]
pub fn spawn_supervisor(
    mut child: Child,
    shutdown: CancellationToken,
    grace: Duration,
) -> JoinHandle<ChildExit> {
    tokio::spawn(async move {
        tokio::select! {
            result = child.wait() => {
                let (code, reason) = match result {
                    Ok(status) => {
                        let code = status.code();
                        let reason = code.map_or_else(
                            || "process terminated by signal".to_owned(),
                            |c| format!("process exited with code {c}"),
                        );
                        (code, reason)
                    }
                    Err(err) => (None, format!("wait error: {err}")),
                };
                warn!(?code, %reason, "child process exited unexpectedly");
                ChildExit::Unexpected { code, reason }
            }
            () = shutdown.cancelled() => {
                terminate(&mut child, grace).await;
                ChildExit::Stopped
            }
        }
    })
}

/// Ask the child to exit, then kill it if it outlives `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    request_exit(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "child process stopped"),
        Ok(Err(err)) => warn!(%err, "error waiting for child process to stop"),
        Err(_elapsed) => {
            warn!(?grace, "child process ignored termination request, killing");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill child process");
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        // Already reaped.
        return;
    };

    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, %err, "failed to send SIGTERM to child process");
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to signal child process");
    }
}

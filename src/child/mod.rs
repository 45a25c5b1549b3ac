//! Child process stdio handling.
//!
//! The bridge talks to exactly one child over two pipes:
//! - `codec`: newline framing with a per-line length limit.
//! - `writer`: the single task that owns the child's stdin.
//! - `spawner`: process launch and stderr forwarding.
//! - `supervisor`: exit monitoring and graceful termination.
//!
//! [`ChildChannel::open`] splits a stdin/stdout pair into a cloneable send
//! handle and a single-consumer [`ChildLines`] stream. Ownership of the
//! stream is what keeps stdout single-consumer: only whoever holds it can
//! read lines.

pub mod codec;
pub mod spawner;
pub mod supervisor;
pub mod writer;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use self::codec::LineCodec;
use self::writer::{run_writer, OutboundLine};
use crate::{AppError, Result};

/// Lazy, non-restartable sequence of framed stdout lines.
pub type ChildLines<R> = FramedRead<R, LineCodec>;

/// Outbound lines that may queue ahead of the writer task.
const OUTBOUND_QUEUE: usize = 256;

/// Send side of the child's stdio.
#[derive(Debug, Clone)]
pub struct ChildChannel {
    outbound: mpsc::Sender<OutboundLine>,
}

impl ChildChannel {
    /// Wire up a child's stdin and stdout.
    ///
    /// Spawns the writer task on the current runtime and returns the send
    /// handle, the stdout line stream, and the writer's join handle.
    pub fn open<W, R>(
        stdin: W,
        stdout: R,
        cancel: CancellationToken,
    ) -> (Self, ChildLines<R>, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(run_writer(stdin, rx, cancel));
        let lines = FramedRead::new(stdout, LineCodec::new());
        (Self { outbound: tx }, lines, writer)
    }

    /// Write `line` followed by `\n` to the child's stdin.
    ///
    /// Resolves once the whole line is written, so a caller that sees `Ok`
    /// knows the child can read its request.
    ///
    /// # Errors
    ///
    /// - [`AppError::Child`] if `line` contains a newline (it would split
    ///   into two messages on the wire).
    /// - [`AppError::ChildUnavailable`] if the writer task has stopped or the
    ///   pipe write failed.
    pub async fn send(&self, line: &str) -> Result<()> {
        if line.contains('\n') {
            return Err(AppError::Child("outbound line contains a newline".into()));
        }

        let (ack, ack_rx) = oneshot::channel();
        let message = OutboundLine {
            line: line.to_owned(),
            ack,
        };

        self.outbound
            .send(message)
            .await
            .map_err(|_| AppError::ChildUnavailable("child stdin is closed".into()))?;

        ack_rx
            .await
            .map_err(|_| AppError::ChildUnavailable("child writer stopped".into()))?
    }

    /// Whether the writer task is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

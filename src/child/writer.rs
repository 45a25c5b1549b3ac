//! Child stdin writer task.
//!
//! Every outbound line passes through one task that owns the pipe, so two
//! concurrent POSTs can never interleave partial lines on the child's stdin.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// One line queued for the child, with a channel to report the write result.
#[derive(Debug)]
pub struct OutboundLine {
    /// Serialized JSON-RPC message without its trailing newline.
    pub line: String,
    /// Receives `Ok(())` once the full line has been written and flushed.
    pub ack: oneshot::Sender<Result<()>>,
}

/// Writer task: drains `msg_rx` and writes each line plus `\n` to `stdin`.
///
/// A line whose `ack` receiver is already gone is skipped, so a request
/// that timed out while queued never reaches the child.
///
/// The task exits when:
/// - `cancel` fires (shutdown), even in the middle of a blocked write,
/// - `msg_rx` closes (every [`ChildChannel`](super::ChildChannel) dropped), or
/// - a write fails, in which case the failing sender is told
///   [`AppError::ChildUnavailable`] and later sends fail because the channel
///   is closed.
///
/// # Errors
///
/// Returns [`AppError::ChildUnavailable`]`("write failed: …")` when the pipe
/// breaks.
pub async fn run_writer<W>(
    stdin: W,
    mut msg_rx: mpsc::Receiver<OutboundLine>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stdin = stdin;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("child writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(OutboundLine { line, ack }) = msg else {
                    debug!("child writer: message channel closed, stopping");
                    break;
                };

                if ack.is_closed() {
                    // The requester timed out or disconnected while queued.
                    debug!("child writer: requester gone, line skipped");
                    continue;
                }

                let mut bytes = line.into_bytes();
                bytes.push(b'\n');

                // A child that stops reading must not block shutdown.
                let written = tokio::select! {
                    biased;

                    () = cancel.cancelled() => {
                        debug!("child writer: cancelled mid-write, stopping");
                        let _ = ack.send(Err(AppError::ChildUnavailable(
                            "bridge shutting down".into(),
                        )));
                        break;
                    }

                    written = write_line(&mut stdin, &bytes) => written,
                };

                if let Err(err) = written {
                    warn!(error = %err, "child writer: write to stdin failed");
                    let failure = AppError::ChildUnavailable(format!("write failed: {err}"));
                    let _ = ack.send(Err(failure.clone()));
                    return Err(failure);
                }

                // The requester may have given up already; nothing to do then.
                let _ = ack.send(Ok(()));
            }
        }
    }

    Ok(())
}

async fn write_line<W>(stdin: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

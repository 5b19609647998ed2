//! Result streamer: drains the result channel onto the response as
//! server-sent events.
//!
//! Each [`DeliveryResult`] becomes one frame:
//!
//! ```text
//! data: {"email":"a@x.com","status":"success"}\n\n
//! ```
//!
//! The writer is flushed after every frame so the client sees each result as
//! soon as it is produced. Frames are written in the order results arrive,
//! which is completion order, not batch order.

use crate::server::streaming::buffer::BufferPool;
use bytes::{BufMut, BytesMut};
use mailly_core::{Error, Result, types::DeliveryResult};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

const EVENT_PREFIX: &[u8] = b"data: ";
const EVENT_SUFFIX: &[u8] = b"\n\n";

/// Why the streamer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every producer finished and every result was written.
    Completed,
    /// The cancellation signal fired.
    Cancelled,
    /// A write or flush failed; the client is gone.
    ClientGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub emitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcome: StreamOutcome,
}

impl StreamSummary {
    const fn new() -> Self {
        Self {
            emitted: 0,
            succeeded: 0,
            failed: 0,
            outcome: StreamOutcome::Completed,
        }
    }
}

/// Appends one SSE frame for `result` to `buf`.
///
/// # Errors
///
/// Returns [`Error::Streaming`] if the result cannot be serialized.
pub fn encode_event(buf: &mut BytesMut, result: &DeliveryResult) -> Result<()> {
    buf.extend_from_slice(EVENT_PREFIX);
    serde_json::to_writer((&mut *buf).writer(), result).map_err(|e| Error::Streaming {
        context: format!("failed to encode result: {e}"),
    })?;
    buf.extend_from_slice(EVENT_SUFFIX);
    Ok(())
}

/// Writes results to `writer` until the channel closes, `cancel` fires or a
/// write fails.
///
/// Cancellation is checked before every receive and raced against every
/// write. Once this returns, no further frame is written.
pub async fn stream_results<W>(
    mut results: mpsc::Receiver<DeliveryResult>,
    writer: &mut W,
    pool: &BufferPool,
    cancel: &CancellationToken,
) -> StreamSummary
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut summary = StreamSummary::new();

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                summary.outcome = StreamOutcome::Cancelled;
                break;
            }
            result = results.recv() => match result {
                Some(result) => result,
                None => break,
            },
        };

        let mut buf = pool.acquire();
        if let Err(e) = encode_event(&mut buf, &result) {
            tracing::error!("Dropping result for {}: {e}", result.recipient);
            continue;
        }

        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = write_frame(writer, &buf) => Some(res),
        };

        match written {
            None => {
                summary.outcome = StreamOutcome::Cancelled;
                break;
            }
            Some(Err(e)) => {
                tracing::debug!("Client stopped reading results: {e}");
                summary.outcome = StreamOutcome::ClientGone;
                break;
            }
            Some(Ok(())) => {
                summary.emitted += 1;
                if result.is_success() {
                    summary.succeeded += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }
    }

    summary
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

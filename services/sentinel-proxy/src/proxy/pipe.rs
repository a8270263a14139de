//! One-directional byte copy with correlated close.
//!
//! A session runs up to four pipes (client <-> relay <-> backend). They share
//! a hangup token: whichever pipe finishes first cancels it, which tells the
//! dial loop to give up and stops the pipes reading from sockets.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 8192;

/// What a pipe does once the session's hangup token fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnHangup {
    /// Stop reading at once. For pipes reading from a socket, which would
    /// otherwise block until the remote side speaks.
    Abort,
    /// Keep copying for at most the given grace period. For pipes reading
    /// from the in-memory relay: its writer is always shut down when the
    /// session winds down, and draining it delivers bytes already accepted
    /// from the peer. The bound covers a destination that stopped reading.
    Drain(Duration),
}

/// How a pipe ended.
#[derive(Debug)]
pub enum PipeEnd {
    /// The reader reached end of stream.
    Eof,
    /// Reading or writing failed.
    Failed(io::Error),
    /// Stopped by the hangup token.
    HungUp,
    /// The destination did not take the remaining bytes within the grace period.
    Stalled,
}

/// Copy `reader` into `writer` until the reader ends, fails or the session hangs up.
///
/// On return the writer has been shut down, the reader dropped and `hangup`
/// cancelled. Returns the number of bytes copied.
pub async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    label: &'static str,
    hangup: CancellationToken,
    on_hangup: OnHangup,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    let end = {
        let copy = copy_counted(&mut reader, &mut writer, &mut total);
        tokio::pin!(copy);
        let end = tokio::select! {
            end = &mut copy => Some(end),
            _ = hangup.cancelled() => None,
        };
        match (end, on_hangup) {
            (Some(end), _) => end,
            (None, OnHangup::Abort) => PipeEnd::HungUp,
            (None, OnHangup::Drain(grace)) => match timeout(grace, &mut copy).await {
                Ok(end) => end,
                Err(_) => PipeEnd::Stalled,
            },
        }
    };

    match &end {
        PipeEnd::Eof => debug!(pipe = label, bytes = total, "Hung up"),
        PipeEnd::Failed(e) => debug!(pipe = label, bytes = total, error = %e, "Hung up"),
        PipeEnd::HungUp => debug!(pipe = label, bytes = total, "Closed after peer hung up"),
        PipeEnd::Stalled => {
            debug!(pipe = label, bytes = total, "Gave up draining after peer hung up")
        }
    }

    // Shutting down an already closed writer only yields an error.
    let _ = writer.shutdown().await;
    drop(reader);
    hangup.cancel();

    total
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> PipeEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return PipeEnd::Eof,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return PipeEnd::Failed(e);
                }
                *total += n as u64;
            }
            Err(e) => return PipeEnd::Failed(e),
        }
    }
}

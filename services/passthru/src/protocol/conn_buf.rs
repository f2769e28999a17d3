//! Peekable connection buffer with a one-time downstream handoff.
//!
//! Inbound bytes accumulate in the buffer while protocol sniffers peek at
//! them concurrently. Once a destination is known, [`ConnBuf::set_downstream`]
//! flushes the sniffed prefix to it and every later write passes straight
//! through.
//!
//! ```text
//! Buffering --set_downstream--> Draining --flush ok--> Passthrough
//!     |                            |                        |
//!     +----------close-------------+---------close----------+--> Closed
//! ```
//!
//! All state lives behind a single async mutex so the flush-then-passthrough
//! transition is atomic for the downstream writer: no interleaving, no
//! duplication, no loss.

use std::io;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

/// Writer that receives the connection bytes once routing has resolved.
pub type Downstream = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors returned by [`ConnBuf`] operations.
#[derive(Debug, Error)]
pub enum ConnBufError {
    /// The buffer was closed before the write.
    #[error("connection buffer closed")]
    Closed,

    /// Fewer bytes are resident than requested. Retry once more arrive.
    #[error("not enough data in buffer: wanted {wanted}, have {available}")]
    NotEnoughData { wanted: usize, available: usize },

    /// The buffer is closed and cannot satisfy the request.
    #[error("end of stream")]
    Eof,

    /// Bytes now flow to a downstream writer; reads and peeks are over.
    #[error("downstream already set")]
    DownstreamSet,

    /// Writing to the downstream failed.
    #[error("downstream i/o: {0}")]
    Io(#[from] io::Error),
}

impl ConnBufError {
    /// True if retrying after more bytes arrive may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnBufError::NotEnoughData { .. })
    }
}

impl From<ConnBufError> for io::Error {
    fn from(err: ConnBufError) -> Self {
        match err {
            ConnBufError::Io(e) => e,
            ConnBufError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            ConnBufError::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::other(other),
        }
    }
}

enum Mode {
    Buffering,
    Draining(Downstream),
    Passthrough(Downstream),
    Closed,
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Buffering => "buffering",
            Mode::Draining(_) => "draining",
            Mode::Passthrough(_) => "passthrough",
            Mode::Closed => "closed",
        }
    }
}

struct Inner {
    mode: Mode,
    buf: BytesMut,
}

impl Inner {
    /// Flush resident bytes to the downstream and enter passthrough.
    ///
    /// A failed flush drops the writer and closes the buffer, so a partially
    /// written prefix is never retried.
    async fn drain(&mut self) -> Result<(), ConnBufError> {
        let Mode::Draining(writer) = &mut self.mode else {
            return Ok(());
        };

        if !self.buf.is_empty() {
            let flushed = match writer.write_all(&self.buf).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };

            if let Err(e) = flushed {
                self.mode = Mode::Closed;
                return Err(e.into());
            }
            trace!(bytes = self.buf.len(), "Flushed buffered prefix downstream");
            self.buf.clear();
        }

        self.mode = match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Draining(writer) => Mode::Passthrough(writer),
            other => other,
        };
        Ok(())
    }
}

/// Thread-safe, append-only connection buffer.
pub struct ConnBuf {
    inner: Mutex<Inner>,
    readable: Notify,
}

impl ConnBuf {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Buffering,
                buf: BytesMut::with_capacity(4096),
            }),
            readable: Notify::new(),
        }
    }

    /// Append bytes, or pass them straight through once a downstream is set.
    ///
    /// The first write after the handoff flushes anything still buffered
    /// before `data`.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ConnBufError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.mode {
            Mode::Closed => return Err(ConnBufError::Closed),
            Mode::Buffering => {
                inner.buf.extend_from_slice(data);
                self.readable.notify_waiters();
                return Ok(data.len());
            }
            Mode::Draining(_) => inner.drain().await?,
            Mode::Passthrough(_) => {}
        }

        if let Mode::Passthrough(writer) = &mut inner.mode {
            writer.write_all(data).await?;
            writer.flush().await?;
        }
        Ok(data.len())
    }

    /// Destructive read. Waits until at least one byte is resident or the
    /// buffer is closed; returns `Ok(0)` at end of stream.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize, ConnBufError> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Mode::Draining(_) | Mode::Passthrough(_) = inner.mode {
                    return Err(ConnBufError::DownstreamSet);
                }

                if !inner.buf.is_empty() {
                    let n = out.len().min(inner.buf.len());
                    out[..n].copy_from_slice(&inner.buf[..n]);
                    inner.buf.advance(n);
                    return Ok(n);
                }

                if let Mode::Closed = inner.mode {
                    return Ok(0);
                }
            }

            notified.await;
        }
    }

    /// Copy the leading bytes into `out` without consuming them.
    ///
    /// Requires at least `n` resident bytes; otherwise fails with
    /// `NotEnoughData` (retry later) or, once closed, `Eof`. Returns the
    /// number of bytes copied, which is `min(out.len(), resident)`.
    pub async fn peek(&self, out: &mut [u8], n: usize) -> Result<usize, ConnBufError> {
        let inner = self.inner.lock().await;

        let closed = match inner.mode {
            Mode::Draining(_) | Mode::Passthrough(_) => return Err(ConnBufError::DownstreamSet),
            Mode::Closed => true,
            Mode::Buffering => false,
        };

        let available = inner.buf.len();
        if available < n {
            return Err(if closed {
                ConnBufError::Eof
            } else {
                ConnBufError::NotEnoughData {
                    wanted: n,
                    available,
                }
            });
        }

        let copied = out.len().min(available);
        out[..copied].copy_from_slice(&inner.buf[..copied]);
        Ok(copied)
    }

    /// Hand the connection over to `writer`.
    ///
    /// Resident bytes are flushed first, then buffering stops for good.
    /// Setting a downstream twice is a programming error and fails with
    /// `DownstreamSet`. If the buffer was already closed (the client finished
    /// sending before routing resolved), the resident bytes are flushed and
    /// the writer is shut down.
    pub async fn set_downstream(&self, mut writer: Downstream) -> Result<(), ConnBufError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        match inner.mode {
            Mode::Buffering => {
                inner.mode = Mode::Draining(writer);
                let drained = inner.drain().await;
                self.readable.notify_waiters();
                drained
            }
            Mode::Closed => {
                if !inner.buf.is_empty() {
                    writer.write_all(&inner.buf).await?;
                    inner.buf.clear();
                }
                writer.shutdown().await?;
                debug!("Downstream set on closed buffer; flushed and shut down");
                Ok(())
            }
            Mode::Draining(_) | Mode::Passthrough(_) => Err(ConnBufError::DownstreamSet),
        }
    }

    /// Close the buffer. Pending reads return end of stream, later writes
    /// fail, and a downstream writer is shut down. Idempotent.
    pub async fn close(&self) -> Result<(), ConnBufError> {
        let mut inner = self.inner.lock().await;
        let previous = std::mem::replace(&mut inner.mode, Mode::Closed);
        self.readable.notify_waiters();

        match previous {
            Mode::Draining(mut writer) | Mode::Passthrough(mut writer) => {
                trace!("Shutting down downstream");
                writer.shutdown().await?;
            }
            Mode::Buffering | Mode::Closed => {}
        }
        Ok(())
    }

    /// Number of resident (not yet read or flushed) bytes.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.buf.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        matches!(self.inner.lock().await.mode, Mode::Closed)
    }

    /// Current state name, for logging.
    pub async fn mode(&self) -> &'static str {
        self.inner.lock().await.mode.name()
    }
}

impl Default for ConnBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnBuf").finish_non_exhaustive()
    }
}

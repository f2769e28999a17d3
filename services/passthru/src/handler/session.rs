//! Per-connection handling.
//!
//! `BUFFERING -> ACTION_RESOLVED -> {FORWARDING | REJECTED} -> CLOSED`
//!
//! The client's bytes are pumped into a [`ConnBuf`] from the moment the
//! connection is accepted. The protocol race only peeks at that buffer. On
//! FORWARD the buffer is handed the destination's write half, which flushes
//! the sniffed prefix and turns the same pump into a straight pipe.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::HandlerError;
use crate::context::Context;
use crate::protocol::{ConnBuf, ConnBufError, ProtocolManager, Verdict};

const COPY_BUF_SIZE: usize = 8192;

/// How a handled connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Piped to `to` until both directions finished.
    Forwarded {
        to: String,
        /// Client to destination, sniffed prefix included.
        bytes_up: u64,
        /// Destination to client.
        bytes_down: u64,
    },
    /// Closed without dialing.
    Rejected,
}

/// Route one accepted connection and carry out the action.
///
/// `ctx` bounds the sniffing phase only. `shutdown` ends the session in any
/// phase: sniffing, dialing, or an established pipe.
/// The client and any dialed destination are closed on every return path.
pub(crate) async fn handle_connection(
    manager: &ProtocolManager,
    ctx: &Context,
    dial_timeout: Duration,
    shutdown: &CancellationToken,
    client: TcpStream,
) -> Result<(Verdict, Outcome), HandlerError> {
    let (client_read, client_write) = client.into_split();
    let buf = Arc::new(ConnBuf::new());
    let mut inbound = tokio::spawn(pump_inbound(client_read, Arc::clone(&buf)));

    let result = route(
        manager,
        ctx,
        dial_timeout,
        shutdown,
        &buf,
        &mut inbound,
        client_write,
    )
    .await;

    inbound.abort();
    if let Err(e) = buf.close().await {
        trace!(error = %e, "Closing connection buffer");
    }
    result
}

async fn route(
    manager: &ProtocolManager,
    ctx: &Context,
    dial_timeout: Duration,
    shutdown: &CancellationToken,
    buf: &Arc<ConnBuf>,
    inbound: &mut JoinHandle<Result<u64, HandlerError>>,
    client_write: OwnedWriteHalf,
) -> Result<(Verdict, Outcome), HandlerError> {
    let verdict = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(HandlerError::ServerStopped),
        verdict = manager.find_action(ctx, Arc::clone(buf)) => verdict?,
    };

    let Some(to_addr) = verdict.action().to_addr().map(str::to_string) else {
        return Ok((verdict, Outcome::Rejected));
    };

    let destination = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(HandlerError::ServerStopped),
        destination = dial(&to_addr, dial_timeout) => destination?,
    };
    let buffered = buf.len().await;
    debug!(to_addr = %to_addr, buffered = buffered, "Connected to destination");

    let (dst_read, dst_write) = destination.into_split();
    buf.set_downstream(Box::new(dst_write)).await?;

    let pipe = async {
        let outbound = pump_outbound(dst_read, client_write);
        tokio::pin!(outbound);

        // Either direction failing ends the session.
        tokio::select! {
            up = &mut *inbound => {
                let up = up.map_err(io::Error::from)??;
                let down = outbound.await?;
                Ok::<_, HandlerError>((up, down))
            }
            down = &mut outbound => {
                let down = down?;
                let up = inbound.await.map_err(io::Error::from)??;
                Ok::<_, HandlerError>((up, down))
            }
        }
    };

    let (bytes_up, bytes_down) = tokio::select! {
        result = pipe => result?,
        _ = shutdown.cancelled() => return Err(HandlerError::ServerStopped),
    };

    Ok((
        verdict,
        Outcome::Forwarded {
            to: to_addr,
            bytes_up,
            bytes_down,
        },
    ))
}

async fn dial(addr: &str, dial_timeout: Duration) -> Result<TcpStream, HandlerError> {
    let dial_error = |source| HandlerError::Dial {
        addr: addr.to_string(),
        source,
    };

    match tokio::time::timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).map_err(dial_error)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(dial_error(e)),
        Err(_) => Err(dial_error(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}

/// Client to buffer (and, after the handoff, to the destination).
///
/// Closes the buffer when the client is done sending, which half-closes the
/// destination once forwarding.
async fn pump_inbound(
    mut client: OwnedReadHalf,
    buf: Arc<ConnBuf>,
) -> Result<u64, HandlerError> {
    let mut total = 0u64;
    let mut chunk = vec![0u8; COPY_BUF_SIZE];

    let result = loop {
        let n = match client.read(&mut chunk).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e.into()),
        };

        match buf.write(&chunk[..n]).await {
            Ok(_) => total += n as u64,
            // Rejected or torn down while the client was still sending.
            Err(ConnBufError::Closed) => break Ok(total),
            Err(e) => break Err(e.into()),
        }
    };

    if let Err(e) = buf.close().await {
        trace!(error = %e, "Closing connection buffer after client EOF");
    }
    result
}

/// Destination to client.
async fn pump_outbound(
    mut destination: OwnedReadHalf,
    mut client: OwnedWriteHalf,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut chunk = vec![0u8; COPY_BUF_SIZE];

    loop {
        let n = destination.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        client.write_all(&chunk[..n]).await?;
        total += n as u64;
    }

    client.shutdown().await?;
    Ok(total)
}

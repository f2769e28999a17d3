//! TCP listener, admission policy, and the worker loop.
//!
//! A [`Server`] accepts connections on one listen address and hands each to
//! the shared per-connection handler. Two admission policies:
//! - [`ServerMode::Unlimited`]: every accepted connection is handled at once
//!   in its own task with its own sniffing deadline.
//! - [`ServerMode::Worker`]: accepted connections queue on a bounded channel
//!   and external workers pull them one at a time with
//!   [`Server::handle_next`] (see [`run_worker`]).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::session::{handle_connection, Outcome};
use super::HandlerError;
use crate::context::Context;
use crate::protocol::{ProtocolManager, Verdict};

/// Default deadline for identifying a connection.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connect timeout for destinations.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of accepted connections waiting for a worker.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How accepted connections reach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// Connections queue until a worker calls [`Server::handle_next`].
    #[default]
    Worker,
    /// Every connection is handled immediately.
    Unlimited,
}

/// Configuration for a server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub mode: ServerMode,
    /// Deadline for identifying a connection.
    pub sniff_timeout: Duration,
    /// Connect timeout for destinations.
    pub dial_timeout: Duration,
    /// Queue capacity in worker mode.
    pub queue_depth: usize,
}

impl ServerOptions {
    pub fn new(mode: ServerMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            mode: ServerMode::default(),
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Statistics for a server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections fully handled.
    pub connections_closed: AtomicU64,
    /// Connections piped to a destination.
    pub forwarded: AtomicU64,
    /// Connections closed without dialing.
    pub rejected: AtomicU64,
    /// Connections routed by the catch-all action.
    pub catch_all: AtomicU64,
    /// Connections that ended in an error.
    pub failed: AtomicU64,
    /// Bytes proxied to destinations.
    pub bytes_to_destination: AtomicU64,
    /// Bytes proxied from destinations.
    pub bytes_from_destination: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub forwarded: u64,
    pub rejected: u64,
    pub catch_all: u64,
    pub failed: u64,
    pub bytes_to_destination: u64,
    pub bytes_from_destination: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            catch_all: self.catch_all.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_to_destination: self.bytes_to_destination.load(Ordering::Relaxed),
            bytes_from_destination: self.bytes_from_destination.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<(Verdict, Outcome), HandlerError>) {
        match result {
            Ok((verdict, outcome)) => {
                if verdict.is_catch_all() {
                    self.catch_all.fetch_add(1, Ordering::Relaxed);
                }
                match outcome {
                    Outcome::Forwarded {
                        bytes_up,
                        bytes_down,
                        ..
                    } => {
                        self.forwarded.fetch_add(1, Ordering::Relaxed);
                        self.bytes_to_destination
                            .fetch_add(*bytes_up, Ordering::Relaxed);
                        self.bytes_from_destination
                            .fetch_add(*bytes_down, Ordering::Relaxed);
                    }
                    Outcome::Rejected => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(HandlerError::ServerStopped) => {}
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// State shared by the accept loop, workers, and connection tasks.
struct Shared {
    manager: Arc<ProtocolManager>,
    options: ServerOptions,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
}

impl Shared {
    async fn serve(
        &self,
        ctx: &Context,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Outcome, HandlerError> {
        debug!(peer_addr = %peer_addr, "Handling connection");
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let result = handle_connection(
            &self.manager,
            ctx,
            self.options.dial_timeout,
            &self.shutdown,
            stream,
        )
        .await;

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.stats.record(&result);

        match &result {
            Ok((verdict, Outcome::Forwarded { to, bytes_up, bytes_down })) => debug!(
                to_addr = %to,
                catch_all = verdict.is_catch_all(),
                bytes_up = bytes_up,
                bytes_down = bytes_down,
                "Connection closed"
            ),
            Ok((verdict, Outcome::Rejected)) => {
                debug!(catch_all = verdict.is_catch_all(), "Connection rejected")
            }
            Err(e @ (HandlerError::UnknownAction(_) | HandlerError::Dial { .. })) => {
                warn!(error = %e, reason = e.reason_code(), "Connection failed")
            }
            Err(e) => debug!(error = %e, reason = e.reason_code(), "Connection error"),
        }

        result.map(|(_, outcome)| outcome)
    }
}

type Queued = (TcpStream, SocketAddr);

enum Admission {
    Spawn(TaskTracker),
    Queue(mpsc::Sender<Queued>),
}

/// A listening passthru server.
pub struct Server {
    local_addr: SocketAddr,
    mode: ServerMode,
    shared: Arc<Shared>,
    queue: Option<Mutex<mpsc::Receiver<Queued>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sessions: TaskTracker,
}

impl Server {
    /// Bind `addr` and start accepting connections.
    pub async fn start(
        addr: impl ToSocketAddrs,
        manager: Arc<ProtocolManager>,
        options: ServerOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let mode = options.mode;

        info!(
            bind_addr = %local_addr,
            mode = ?mode,
            sniff_timeout_ms = options.sniff_timeout.as_millis() as u64,
            "Server listening"
        );

        let sessions = TaskTracker::new();
        let (queue, admission) = match mode {
            ServerMode::Worker => {
                let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
                (Some(Mutex::new(rx)), Admission::Queue(tx))
            }
            ServerMode::Unlimited => (None, Admission::Spawn(sessions.clone())),
        };

        let shared = Arc::new(Shared {
            manager,
            options,
            stats: Arc::new(ServerStats::default()),
            shutdown: CancellationToken::new(),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), admission));

        Ok(Self {
            local_addr,
            mode,
            shared,
            queue,
            accept_task: Mutex::new(Some(accept_task)),
            sessions,
        })
    }

    /// Get the local address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// Get server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Wait for the next queued connection and handle it.
    ///
    /// `ctx` bounds the wait. Identification gets the full sniff timeout from
    /// the moment the connection is dequeued, and still ends early if `ctx`
    /// is cancelled. Returns `ServerStopped` once the server is stopped and
    /// `Interrupted` if `ctx` is done first.
    pub async fn handle_next(&self, ctx: &Context) -> Result<Outcome, HandlerError> {
        let queue = self.queue.as_ref().ok_or(HandlerError::NotWorkerMode)?;

        let next = tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => return Err(HandlerError::ServerStopped),
            interrupt = ctx.done() => return Err(interrupt.into()),
            next = async { queue.lock().await.recv().await } => next,
        };
        let (stream, peer_addr) = next.ok_or(HandlerError::ServerStopped)?;

        let sniff_ctx = ctx.child_with_fresh_timeout(self.shared.options.sniff_timeout);
        self.shared
            .serve(&sniff_ctx, stream, peer_addr)
            .instrument(info_span!("connection", peer = %peer_addr))
            .await
    }

    /// Close the listener and end every connection this server owns.
    ///
    /// Queued connections are dropped, waiting and later `handle_next` calls
    /// return `ServerStopped`, and established pipes are torn down.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();

        let accept_task = self.accept_task.lock().await.take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        if let Some(queue) = &self.queue {
            let mut rx = queue.lock().await;
            rx.close();
            let mut dropped = 0u64;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!(dropped = dropped, "Dropped queued connections");
            }
        }

        self.sessions.close();
        self.sessions.wait().await;
        info!(bind_addr = %self.local_addr, "Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("mode", &self.mode)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, admission: Admission) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Accept error");
                // Brief sleep to avoid tight loop on persistent errors
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        shared
            .stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        match &admission {
            Admission::Spawn(sessions) => {
                let shared = Arc::clone(&shared);
                sessions.spawn(
                    async move {
                        let ctx = Context::from_token(shared.shutdown.child_token())
                            .child_with_timeout(shared.options.sniff_timeout);
                        // Outcome already logged and counted.
                        let _ = shared.serve(&ctx, stream, peer_addr).await;
                    }
                    .instrument(info_span!("connection", peer = %peer_addr)),
                );
            }
            Admission::Queue(tx) => {
                tokio::select! {
                    biased;
                    _ = shared.shutdown.cancelled() => break,
                    sent = tx.send((stream, peer_addr)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("Accept loop stopped");
}

/// Pull connections from `server` until it stops.
///
/// Each iteration waits at most `timeout` for a connection; an idle timeout
/// just starts the next iteration.
pub async fn run_worker(server: Arc<Server>, worker_id: usize, timeout: Duration) {
    debug!(worker_id = worker_id, bind_addr = %server.local_addr(), "Worker started");

    loop {
        let ctx = Context::with_timeout(timeout);
        match server.handle_next(&ctx).await {
            Ok(_) | Err(HandlerError::Interrupted(_)) => {}
            Err(HandlerError::ServerStopped) => break,
            Err(HandlerError::NotWorkerMode) => {
                error!(worker_id = worker_id, "Server does not queue connections");
                break;
            }
            // Everything else is per-connection and already logged.
            Err(_) => {}
        }
    }

    debug!(worker_id = worker_id, "Worker stopped");
}

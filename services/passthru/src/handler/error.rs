//! Error types for connection handling.

use std::io;

use thiserror::Error;

use crate::context::Interrupt;
use crate::protocol::{ConnBufError, UnknownRule};

/// Connection handling errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The server was stopped; no more connections will be handed out.
    #[error("server stopped")]
    ServerStopped,

    /// A protocol matched a rule with no configured action.
    #[error("unknown action: {0}")]
    UnknownAction(#[from] UnknownRule),

    /// `handle_next` called on a server that does not queue connections.
    #[error("server is not in worker mode")]
    NotWorkerMode,

    /// The caller's context was done while waiting for a connection.
    #[error("waiting for a connection: {0}")]
    Interrupted(#[from] Interrupt),

    /// The destination could not be reached.
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Handing the connection buffer to the destination failed.
    #[error("connection buffer: {0}")]
    Buffer(#[from] ConnBufError),

    /// IO error while piping.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl HandlerError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            HandlerError::ServerStopped => "server_stopped",
            HandlerError::UnknownAction(_) => "unknown_action",
            HandlerError::NotWorkerMode => "not_worker_mode",
            HandlerError::Interrupted(Interrupt::Cancelled) => "cancelled",
            HandlerError::Interrupted(Interrupt::DeadlineExceeded) => "deadline_exceeded",
            HandlerError::Dial { .. } => "dial_failed",
            HandlerError::Buffer(_) => "buffer_error",
            HandlerError::Io(_) => "io_error",
        }
    }
}

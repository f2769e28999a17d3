//! Accepting connections and carrying out routing decisions.

mod error;
mod server;
mod session;

pub use error::HandlerError;
pub use server::{
    run_worker, Server, ServerMode, ServerOptions, ServerStats, StatsSnapshot,
    DEFAULT_DIAL_TIMEOUT, DEFAULT_QUEUE_DEPTH, DEFAULT_SNIFF_TIMEOUT,
};
pub use session::Outcome;

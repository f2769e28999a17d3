//! passthru
//!
//! Transparent TCP passthrough proxy that routes connections by sniffing the
//! plaintext framing of the protocol they carry, without terminating it.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Server -> ConnBuf --(peek)--> ProtocolManager -> [TLS, ...] race
//!                        |                      |
//!                        |                   Action
//!                        v                      v
//!                 set_downstream <-------- FORWARD: dial destination
//!                        |                 REJECT: close
//!                        v
//!                   Destination
//! ```
//!
//! Every accepted connection gets its own [`ConnBuf`]. Inbound bytes
//! accumulate there while every registered [`Protocol`] races to classify
//! them. The winning `(protocol, rule)` pair selects an [`Action`]; on
//! FORWARD the buffer flushes the sniffed prefix to the destination and
//! switches to passthrough.

pub mod context;
pub mod handler;
pub mod protocol;

pub use context::{Context, Interrupt};
pub use handler::{
    run_worker, HandlerError, Outcome, Server, ServerMode, ServerOptions, ServerStats,
    StatsSnapshot,
};
pub use passthru_config::{Action, Filter, ProtocolGroup};
pub use protocol::{
    supported_protocols, CatchAllReason, ConnBuf, ConnBufError, ImportError, Protocol,
    ProtocolError, ProtocolManager, TlsProtocol, UnknownRule, Verdict,
};

//! Protocol identification.
//!
//! This module provides:
//! - [`ConnBuf`], the peekable per-connection buffer
//! - the [`Protocol`] contract every sniffer implements
//! - [`ProtocolManager`], which races all registered protocols against one
//!   connection and maps the winner to an [`Action`](passthru_config::Action)
//! - [`TlsProtocol`], the TLS ClientHello sniffer (SNI / ALPN / CATCHALL)

mod conn_buf;
mod manager;
mod race;
pub mod tls;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{Context, Interrupt};

pub use conn_buf::{ConnBuf, ConnBufError, Downstream};
pub use manager::{CatchAllReason, ImportError, ProtocolManager, UnknownRule, Verdict};
pub use tls::TlsProtocol;

/// Errors a protocol reports while applying rules or identifying a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A rule string does not follow the protocol's grammar.
    #[error("invalid rule: {0:?}")]
    InvalidRule(String),

    /// The bytes are provably not this protocol. Not retried.
    #[error("not a {protocol} stream: {reason}")]
    NotMatched {
        protocol: &'static str,
        reason: String,
    },

    /// The protocol understood the bytes but no configured rule applies.
    #[error("no rule matched")]
    NoRuleMatched,

    /// The identification context was cancelled or timed out.
    #[error(transparent)]
    Interrupted(#[from] Interrupt),

    /// The connection buffer could not be inspected (closed, handed off).
    #[error("connection buffer: {0}")]
    Buffer(#[from] ConnBufError),
}

impl ProtocolError {
    /// True for classification failures: this protocol lost the race for good.
    pub fn is_classification_failure(&self) -> bool {
        matches!(self, ProtocolError::NotMatched { .. })
    }
}

/// A wire protocol that can classify a connection from its leading bytes.
///
/// Implementations must only ever `peek` the buffer, never read from it.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Stable identifier, used as the key into a protocol group.
    fn name(&self) -> &'static str;

    /// A fresh, independent instance with no rules applied.
    fn clone_with_no_rules(&self) -> Box<dyn Protocol>;

    /// Parse and store an ordered list of rule strings.
    ///
    /// A catch-all rule, wherever it appears, is evaluated last.
    fn apply_rules(&mut self, rules: &[String]) -> Result<(), ProtocolError>;

    /// Return the first rule (by name) matching the connection.
    ///
    /// Keeps retrying while more bytes may arrive, fails fast once the data
    /// is provably not this protocol, and fails with `Interrupted` when `ctx`
    /// is done.
    async fn identify(&self, ctx: &Context, buf: &ConnBuf) -> Result<String, ProtocolError>;
}

/// Template instances of every protocol this build supports.
pub fn supported_protocols() -> Vec<Box<dyn Protocol>> {
    vec![Box::new(TlsProtocol::new())]
}

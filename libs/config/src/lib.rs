//! # passthru-config
//!
//! Configuration model for the passthru proxy.
//!
//! A configuration maps listen addresses to protocol groups. Each protocol
//! group maps a protocol name (such as `TLS`) to a filter, and each filter
//! maps a rule string (such as `SNI example.com`) to an action:
//!
//! ```json
//! {
//!   "min_version": "0.2.0",
//!   "servers": {
//!     "0.0.0.0:443": {
//!       "TLS": {
//!         "SNI example.com": { "type": "FORWARD", "to_addr": "10.0.0.2:443" },
//!         "CATCHALL": { "type": "REJECT" }
//!       },
//!       "CATCHALL": {
//!         "CATCHALL": { "type": "FORWARD", "to_addr": "127.0.0.1:8080" }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! The reserved `CATCHALL` protocol entry holds the action applied when no
//! protocol identifies a connection in time.

mod action;
mod config;
mod error;
mod version;

pub use action::{Action, ActionType};
pub use config::{Config, Filter, ProtocolGroup, ServerGroup};
pub use error::ConfigError;
pub use version::{Fit, Version};

/// Reserved name of the catch-all pseudo-protocol and of its only rule.
pub const CATCHALL: &str = "CATCHALL";

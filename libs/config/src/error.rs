//! Error types for configuration loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when loading, writing, or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read or written.
    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid JSON or does not match the schema.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// An action record is inconsistent (e.g. FORWARD without a destination).
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A version string could not be parsed.
    #[error("invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    /// The reserved CATCHALL protocol entry has the wrong shape.
    #[error("malformed CATCHALL entry for {server}: {reason}")]
    MalformedCatchAll { server: String, reason: String },
}

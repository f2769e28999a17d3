//! Top-level configuration file.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Action, ConfigError, Version, CATCHALL};

/// Rule string to action, e.g. `"SNI example.com" -> FORWARD 10.0.0.2:443`.
///
/// Keys keep the order they were written in, which is the order rules are
/// handed to a protocol.
pub type Filter = IndexMap<String, Action>;

/// Protocol name to its filter, scoped to one listen address.
pub type ProtocolGroup = IndexMap<String, Filter>;

/// Listen address to the protocol group served there.
pub type ServerGroup = IndexMap<String, ProtocolGroup>;

/// A passthru configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Oldest server version this configuration is written for.
    #[serde(default)]
    pub min_version: Version,

    /// Servers to listen on.
    pub servers: ServerGroup,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_json(&data)?;
        debug!(
            path = %path.display(),
            server_count = config.servers.len(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Parse and validate a configuration from a JSON string.
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check invariants serde cannot express.
    ///
    /// The reserved `CATCHALL` protocol entry, when present, must contain
    /// exactly one rule, itself named `CATCHALL`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (server, group) in &self.servers {
            let Some(filter) = group.get(CATCHALL) else {
                continue;
            };

            let malformed = |reason: String| ConfigError::MalformedCatchAll {
                server: server.clone(),
                reason,
            };

            if filter.len() != 1 {
                return Err(malformed(format!(
                    "expected exactly one rule, found {}",
                    filter.len()
                )));
            }
            if !filter.contains_key(CATCHALL) {
                let rules: Vec<&str> = filter.keys().map(String::as_str).collect();
                return Err(malformed(format!(
                    "the only rule must be CATCHALL, found {:?}",
                    rules
                )));
            }
        }
        Ok(())
    }
}

//! Config format versions and compatibility with a server build.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ConfigError;

/// A `MAJOR.MINOR.PATCH` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// How well a config written for one version fits a server of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// The server is at least as new as the config.
    Fits,
    /// The config targets a newer patch release; behavior may differ slightly.
    ShouldFit,
    /// The config targets a newer minor release; some features may not work.
    MayFit,
    /// The config targets a newer major release and must not be used.
    WontFit,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check whether a config requiring `self` can run on `server`.
    pub fn fit_in(&self, server: &Version) -> Fit {
        if self.major != server.major {
            return if self.major > server.major {
                Fit::WontFit
            } else {
                Fit::Fits
            };
        }
        if self.minor != server.minor {
            return if self.minor > server.minor {
                Fit::MayFit
            } else {
                Fit::Fits
            };
        }
        if self.patch > server.patch {
            Fit::ShouldFit
        } else {
            Fit::Fits
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ConfigError;

    /// Parse `1.2.3` or `v1.2.3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidVersion(s.to_string());

        let trimmed = s.trim();
        let digits = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut parts = digits.split('.');

        let mut next = || -> Result<u32, ConfigError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u32>()
                .map_err(|_| invalid())
        };
        let version = Version::new(next()?, next()?, next()?);

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//! Command line settings.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use passthru::{ServerMode, ServerOptions};

/// Transparent TCP passthrough proxy routing on protocol sniffing.
#[derive(Debug, Parser)]
#[command(name = "passthru")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long, env = "PASSTHRU_CONFIG")]
    pub config: PathBuf,

    /// Workers per server; 0 handles every connection immediately.
    #[arg(short = 'w', long, env = "PASSTHRU_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Worker timeout and per-connection sniffing deadline, in seconds.
    #[arg(short = 't', long, env = "PASSTHRU_TIMEOUT", default_value_t = 5)]
    pub timeout: u64,

    /// Destination connect timeout, in seconds.
    #[arg(long, env = "PASSTHRU_DIAL_TIMEOUT", default_value_t = 5)]
    pub dial_timeout: u64,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "PASSTHRU_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn mode(&self) -> ServerMode {
        if self.workers == 0 {
            ServerMode::Unlimited
        } else {
            ServerMode::Worker
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            mode: self.mode(),
            sniff_timeout: self.timeout(),
            dial_timeout: Duration::from_secs(self.dial_timeout),
            queue_depth: self.workers.max(1),
        }
    }
}

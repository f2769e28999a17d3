//! passthru
//!
//! Listens on every address in the configuration file, identifies each
//! connection from its first bytes, and forwards or rejects it according to
//! the configured rules.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use passthru::{
    run_worker, supported_protocols, ProtocolGroup, ProtocolManager, Server, ServerMode,
};
use passthru_config::{Config, Fit, Version};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to PASSTHRU_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting passthru");

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let server_version: Version = env!("CARGO_PKG_VERSION")
        .parse()
        .context("Invalid server version")?;
    check_version(&config.min_version, &server_version)?;

    let options = cli.server_options();
    let mut servers = Vec::with_capacity(config.servers.len());
    let mut workers = JoinSet::new();

    for (addr, group) in &config.servers {
        let manager = build_manager(group)
            .with_context(|| format!("Invalid protocol group for {}", addr))?;

        let server = Server::start(addr.as_str(), Arc::new(manager), options.clone())
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let server = Arc::new(server);

        if options.mode == ServerMode::Worker {
            for worker_id in 0..cli.workers {
                workers.spawn(run_worker(Arc::clone(&server), worker_id, cli.timeout()));
            }
        }

        info!(
            bind_addr = %server.local_addr(),
            mode = ?options.mode,
            workers = cli.workers,
            "Server started"
        );
        servers.push(server);
    }

    if servers.is_empty() {
        warn!("No servers configured");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    for server in &servers {
        server.stop().await;
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Worker ended abnormally");
        }
    }

    for server in &servers {
        let stats = server.stats().snapshot();
        info!(
            bind_addr = %server.local_addr(),
            connections_accepted = stats.connections_accepted,
            forwarded = stats.forwarded,
            rejected = stats.rejected,
            catch_all = stats.catch_all,
            failed = stats.failed,
            bytes_to_destination = stats.bytes_to_destination,
            bytes_from_destination = stats.bytes_from_destination,
            "Server statistics"
        );
    }

    Ok(())
}

/// Refuse configs written for a newer major release; warn on newer minor or patch.
fn check_version(required: &Version, server: &Version) -> Result<()> {
    match required.fit_in(server) {
        Fit::WontFit => bail!(
            "config requires version {} which is too new for this server ({})",
            required,
            server
        ),
        Fit::MayFit => warn!(
            config_version = %required,
            server_version = %server,
            "Config is for a newer minor version; some features may not work"
        ),
        Fit::ShouldFit => info!(
            config_version = %required,
            server_version = %server,
            "Config is for a newer patch version; behavior may differ"
        ),
        Fit::Fits => {}
    }
    Ok(())
}

/// A manager with every supported protocol, configured from `group`.
fn build_manager(group: &ProtocolGroup) -> Result<ProtocolManager> {
    let mut manager = ProtocolManager::new();
    for protocol in supported_protocols() {
        manager.register_protocol(protocol.as_ref());
    }
    manager.import_protocol_group(group)?;
    Ok(manager)
}

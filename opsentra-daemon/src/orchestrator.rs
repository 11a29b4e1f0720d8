//! Role orchestration -- assembly, lifecycle, and the main event loop.
//!
//! The [`Orchestrator`] is the lifecycle supervisor of `opsentra-daemon`.
//! It loads configuration, builds the module for the selected role, starts
//! it, and blocks until a shutdown signal or a fatal module error arrives.
//!
//! # Exit behavior
//!
//! - Configuration faults and startup-order failures return an error from
//!   [`Orchestrator::run`], which `main` turns into a non-zero exit.
//! - A fatal error reported by a running module (broker reconnect
//!   exhaustion) also exits non-zero, after a graceful stop.
//! - `SIGTERM`/`SIGINT` drain and exit zero.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;

use opsentra_core::config::OpsentraConfig;
use opsentra_core::error::OpsentraError;

use crate::cli::Role;
use crate::health::{DaemonHealth, aggregate_status};
use crate::modules::{self, ModuleRegistry};

/// Cadence of periodic health logging.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// The daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: OpsentraConfig,
    /// Selected process role.
    role: Role,
    /// Registry holding the role's module.
    registry: ModuleRegistry,
    /// Fatal error channel from the module.
    fatal_rx: mpsc::Receiver<OpsentraError>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load configuration from disk and build the orchestrator.
    pub async fn build(config_path: &Path, role: Role) -> Result<Self> {
        let config = OpsentraConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config, role)
    }

    /// Build from an already-loaded configuration.
    ///
    /// Useful for testing or when the config has already been loaded.
    pub fn build_from_config(config: OpsentraConfig, role: Role) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        let (handle, fatal_rx) = match role {
            Role::Shipper => modules::shipper::build(&config)
                .map_err(|e| anyhow::anyhow!("failed to build shipper module: {}", e))?,
            Role::Aggregator => modules::aggregator::build(&config)
                .map_err(|e| anyhow::anyhow!("failed to build aggregator module: {}", e))?,
        };

        let mut registry = ModuleRegistry::new();
        registry.register(handle);
        tracing::info!(role = role.as_str(), "orchestrator initialized");

        Ok(Self {
            config,
            role,
            registry,
            fatal_rx,
            start_time: Instant::now(),
        })
    }

    /// Start the module and enter the main event loop.
    ///
    /// Blocks until `SIGTERM`/`SIGINT` (graceful exit) or a fatal module
    /// error (non-zero exit after a graceful stop).
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(role = self.role.as_str(), "starting modules");
        if let Err(e) = self.registry.start_all().await {
            tracing::error!(error = %e, "module startup failed");
            return Err(e.into());
        }

        tracing::info!("entering main event loop");

        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

        let mut health_ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
        health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        health_ticker.tick().await; // immediate first tick

        let mut fatal_channel_open = true;
        let outcome = loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!(signal = "SIGTERM", "shutdown signal received");
                    break Ok(());
                }
                _ = sigint.recv() => {
                    tracing::info!(signal = "SIGINT", "shutdown signal received");
                    break Ok(());
                }
                fatal = self.fatal_rx.recv(), if fatal_channel_open => {
                    match fatal {
                        Some(e) => {
                            tracing::error!(error = %e, "fatal module error");
                            break Err(anyhow::anyhow!("fatal module error: {}", e));
                        }
                        None => {
                            // sender dropped; keep serving until a signal arrives
                            fatal_channel_open = false;
                        }
                    }
                }
                _ = health_ticker.tick() => {
                    let health = self.health().await;
                    tracing::info!(
                        status = %health.status,
                        uptime_secs = health.uptime_secs,
                        "daemon health"
                    );
                }
            }
        };

        tracing::info!("stopping modules");
        if let Err(e) = self.registry.stop_all().await {
            tracing::warn!(error = %e, "module stop reported an error");
        }

        outcome
    }

    /// Current aggregated health report.
    pub async fn health(&self) -> DaemonHealth {
        let modules = self.registry.health_check_all().await;
        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs: self.start_time.elapsed().as_secs(),
            modules,
        }
    }

    /// Reference to the loaded configuration.
    pub fn config(&self) -> &OpsentraConfig {
        &self.config
    }
}

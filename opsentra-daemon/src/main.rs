//! opsentra-daemon -- entry point.
//!
//! Parses CLI arguments, loads and validates configuration, initializes
//! tracing, then hands control to the orchestrator. Startup failures
//! (missing required settings, unreachable dependencies during the ordered
//! startup) exit non-zero with a structured explanation.

use anyhow::Result;
use clap::Parser;

use opsentra_daemon::cli::DaemonCli;
use opsentra_daemon::logging;
use opsentra_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonCli::parse();

    let mut config = opsentra_core::config::OpsentraConfig::load(&args.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", args.config.display(), e))?;
    if let Some(level) = &args.log_level {
        config.general.log_level = level.clone();
    }

    logging::init_tracing(&config.general, args.log_level.as_deref())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        role = args.role.as_str(),
        config = %args.config.display(),
        "opsentra-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config, args.role)?;
    orchestrator.run().await?;

    tracing::info!("opsentra-daemon stopped");
    Ok(())
}

//! CLI argument definitions for opsentra-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// OpSentra log collection and aggregation daemon.
///
/// Runs either the shipper agent (tail local log sources and publish to the
/// broker) or the aggregator service (consume, persist, fan out, archive),
/// selected by `--role`.
#[derive(Parser, Debug)]
#[command(name = "opsentra-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to the opsentra.toml configuration file.
    #[arg(short, long, default_value = "/etc/opsentra/opsentra.toml")]
    pub config: PathBuf,

    /// Which OpSentra role this process runs.
    #[arg(long, value_enum)]
    pub role: Role,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Process role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Log-producing host agent: discover, tail, publish.
    Shipper,
    /// Central service: consume, persist, fan out, archive.
    Aggregator,
}

impl Role {
    /// Role name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shipper => "shipper",
            Self::Aggregator => "aggregator",
        }
    }
}

//! CLI argument parsing for vdm-sim

use clap::Parser;
use std::path::PathBuf;

/// Deterministic real-time scheduler simulation
#[derive(Parser, Debug, Clone)]
#[command(name = "vdmsim")]
#[command(about = "Run a VDM real-time scheduling scenario")]
#[command(version)]
pub struct Cli {
    /// Scenario file (TOML)
    pub scenario: PathBuf,

    /// Override the jitter seed of the scenario
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the time limit of the scenario
    #[arg(long)]
    pub time_limit: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Write the execution-event log as JSON lines
    #[arg(long)]
    pub trace_out: Option<PathBuf>,

    /// Include a metrics snapshot in the report
    #[arg(long)]
    pub metrics: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Skip the test sequences of the scenario
    #[arg(long)]
    pub no_tests: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

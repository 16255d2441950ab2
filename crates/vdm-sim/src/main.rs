//! vdmsim binary
//!
//! Loads a scenario, runs its main entry point and test sequences, and
//! prints the outcome.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vdm_metrics::{timed, Metrics, MetricsSnapshot};
use vdm_scheduler::TraceLog;
use vdm_sim::{Cli, Report, Scenario, Simulation};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse_args();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut scenario = Scenario::load(&cli.scenario)?;
    if let Some(seed) = cli.seed {
        scenario.scheduler.seed = seed;
    }
    if let Some(limit) = cli.time_limit {
        scenario.scheduler.time_limit = Some(limit);
    }

    let mut sim = Simulation::build(scenario)?;
    let metrics = sim.scheduler().metrics();
    // wall-clock timings are kept out of the reported metrics
    let host = Metrics::new();
    let outcome = timed!(host, "sim.main_run_micros", { sim.run_main()? });
    let time = sim.scheduler().current_time();
    tracing::info!(
        time,
        wall_micros = host.get_histogram_mean("sim.main_run_micros").unwrap_or_default(),
        "main run finished"
    );

    if let Some(path) = &cli.trace_out {
        write_trace(&sim.scheduler().trace(), path)?;
    }
    let snapshot = cli
        .metrics
        .then(|| MetricsSnapshot::from_metrics(&metrics));

    let tests = if cli.no_tests {
        Vec::new()
    } else {
        sim.run_tests()?
    };

    let report = Report {
        outcome: outcome.into(),
        time,
        tests,
        metrics: snapshot,
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
        if let Some(snapshot) = &report.metrics {
            println!("{}", snapshot.to_json()?);
        }
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Write the execution-event log as JSON lines
fn write_trace(trace: &TraceLog, path: &Path) -> Result<()> {
    tracing::info!("Writing {} trace events to {:?}", trace.len(), path);
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    trace.write_json_lines(&mut out)?;
    out.flush()?;
    Ok(())
}

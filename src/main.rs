//! CLI Entry Point for power_harness
//!
//! Provides command-line interface for:
//! - Listing the built-in scenarios
//! - Showing a scenario's step list
//! - Running a scenario (optionally repeated) against the simulated bench
//!
//! # Usage
//!
//! ```bash
//! power_harness list
//! power_harness show screen_onoff
//! power_harness run phone_app --repeat 3 --config config/harness.toml
//! ```
//!
//! Ctrl+C during a run requests a cooperative stop; the run ends `Stopped`
//! and nothing further is exported.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use power_harness::config::{HarnessConfig, DEFAULT_CONFIG_PATH};
use power_harness::experiment::{EngineEvent, HarnessContext, RunEngine, RunOptions};
use power_harness::logging;
use power_harness::results::ResultSink;
use power_harness::scenario::ScenarioRegistry;

#[derive(Parser)]
#[command(name = "power_harness")]
#[command(about = "Hardware-in-the-loop power test engine", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered scenarios
    List,

    /// Show the steps of a scenario
    Show {
        /// Scenario key
        scenario: String,
    },

    /// Run a scenario
    Run {
        /// Scenario key
        scenario: String,

        /// Number of iterations
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HarnessConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::List => list(),
        Commands::Show { scenario } => show(&scenario),
        Commands::Run { scenario, repeat } => run(config, &scenario, repeat).await,
    }
}

fn list() -> Result<()> {
    let registry = ScenarioRegistry::builtin();
    for (key, config) in registry.list() {
        println!(
            "{key:<14} {:<14} {:>4.1} V  {:>4}s  {}",
            config.name,
            config.target_voltage,
            config.test_duration.as_secs(),
            config.description
        );
    }
    Ok(())
}

fn show(key: &str) -> Result<()> {
    let registry = ScenarioRegistry::builtin();
    let config = registry.get(key)?;

    println!("{} ({key})", config.name);
    println!("  {}", config.description);
    println!(
        "  voltage {:.2} V, stabilization {:?}, measurement {:?}",
        config.target_voltage, config.stabilization_time, config.test_duration
    );
    println!();
    for (i, step) in config.steps.iter().enumerate() {
        let marker = if step.action.is_measurement_phase() { "*" } else { " " };
        println!(
            "{marker} {:>2}. {:<24} {:<24} {:>8}  {:?}",
            i + 1,
            step.name,
            step.action.to_string(),
            format!("{:?}", step.duration),
            step.action.fault_policy()
        );
    }
    println!();
    println!("* re-run by repeat iterations 2..N");
    Ok(())
}

async fn run(config: HarnessConfig, key: &str, repeat: u32) -> Result<()> {
    if repeat == 0 {
        bail!("--repeat must be at least 1");
    }

    let sink = result_sink(&config);
    let engine = RunEngine::new(HarnessContext::simulated(config, sink));
    let mut events = engine.subscribe();

    if !engine.start(key, RunOptions::repeat(repeat)) {
        bail!("could not start scenario '{key}'");
    }

    let stopper = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStop requested, finishing current slice...");
            stopper.request_stop();
        }
    });

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => eprintln!("({missed} events dropped)"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = engine
        .wait()
        .await
        .context("run task ended without a report")?;
    printer.abort();

    println!();
    for run in &report.iterations {
        println!(
            "iteration {}/{}: {} - {}",
            run.iteration_index, run.iteration_count, run.status, run.message
        );
        if let Some(export) = &run.export {
            match &export.location {
                Some(path) => println!("  exported {} rows to {}", export.rows, path.display()),
                None => println!("  exported {} rows as {}", export.rows, export.name),
            }
        }
    }
    println!("{}", report.message());

    if report.success() {
        Ok(())
    } else {
        bail!("run ended {}", report.status())
    }
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Progress {
            percent,
            status_text,
            step_index,
            total_steps,
        } => println!("[{percent:>5.1}%] {step_index}/{total_steps} {status_text}"),
        EngineEvent::StepCompleted(record) if !record.success => {
            let note = if record.tolerated { "tolerated" } else { "FAILED" };
            println!("         {} {note}", record.name);
        }
        EngineEvent::RunFinished { status, message } => println!("==> {status}: {message}"),
        _ => {}
    }
}

#[cfg(feature = "storage_csv")]
fn result_sink(config: &HarnessConfig) -> Arc<dyn ResultSink> {
    Arc::new(power_harness::results::CsvResultSink::new(
        config.results.output_dir.clone(),
    ))
}

#[cfg(not(feature = "storage_csv"))]
fn result_sink(_config: &HarnessConfig) -> Arc<dyn ResultSink> {
    Arc::new(power_harness::results::MemoryResultSink::new())
}

//! Kraken run supervisor - operator CLI
//!
//! Launches Kraken against a config file, waits for it, verifies the log and
//! prints the collected chaos data as JSON.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use krkn_common::{LogConfig, PortAllocator, init_logging};
use krkn_runner::markers::CHAOS_DATA_MARKER;
use krkn_runner::{ChaosResult, CompletionDetector, CompletionMarkers, KrknRunner, SupervisorConfig};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "krkn-run")]
#[command(author, version, about = "Supervised Kraken chaos runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run Kraken, wait for it and print the chaos data
    Run {
        /// Kraken config file
        #[arg(short, long)]
        config: PathBuf,

        /// Log file Kraken writes (passed as --output)
        #[arg(short, long)]
        output: PathBuf,

        /// Seconds between completion checks
        #[arg(long, default_value = "30")]
        check_interval_secs: u64,

        /// Give up and terminate Kraken after this many seconds
        #[arg(long)]
        max_wait_secs: Option<u64>,

        /// Skip log validation after the run
        #[arg(long)]
        no_verify: bool,
    },

    /// Print the normalized chaos data found in a Kraken log
    Extract {
        /// Kraken log file
        log: PathBuf,

        /// Marker preceding the JSON block
        #[arg(long, default_value = CHAOS_DATA_MARKER)]
        marker: String,
    },

    /// Classify a Kraken log as successful or not
    Verify {
        /// Kraken log file
        log: PathBuf,
    },

    /// Find a free port for the Kraken signal server
    Port {
        /// Address the signal server binds to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to try first
        #[arg(long)]
        preferred: Option<u16>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Run {
            config,
            output,
            check_interval_secs,
            max_wait_secs,
            no_verify,
        } => run(
            config,
            output,
            Duration::from_secs(check_interval_secs.max(1)),
            max_wait_secs.map(Duration::from_secs),
            !no_verify,
        ),
        Commands::Extract { log, marker } => {
            let data = ChaosResult::from_log_file(&log, &marker)
                .with_context(|| format!("extracting chaos data from {}", log.display()))?;
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
        Commands::Verify { log } => {
            let detector = CompletionDetector::new(&log, CompletionMarkers::default());
            let (succeeded, detail) = detector.check_success_completion();
            println!("{}", json!({ "success": succeeded, "detail": detail }));
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Port { host, preferred } => {
            let allocator = PortAllocator::default();
            let port = match preferred {
                Some(port) => allocator.find_available_port(Some(port), &host)?,
                None => allocator.get_port_for_krkn(&host)?,
            };
            println!("{port}");
            Ok(())
        }
    }
}

fn run(
    config: PathBuf,
    output: PathBuf,
    check_interval: Duration,
    max_wait: Option<Duration>,
    verify: bool,
) -> Result<()> {
    let settings = SupervisorConfig::from_env().context("loading KRKN_* settings")?;
    let mut runner = KrknRunner::new(settings, &config, &output)?;
    info!(command = %runner.command_line(), "Starting Kraken");

    runner.run_async()?;
    let summary = runner.wait_for_completion(check_interval, max_wait)?;
    if verify {
        runner.validate_execution_success()?;
    }

    let chaos_data = match runner.get_chaos_data() {
        Ok(data) => Some(data.to_value()),
        Err(e) => {
            warn!(error = %e, "Run finished without chaos data");
            None
        }
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "summary": summary,
            "chaos_data": chaos_data,
        }))?
    );
    Ok(())
}

//! group-sim: run a process group in memory and report what it delivered.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use group_sim::{SimConfig, Simulation};

#[derive(Parser, Debug)]
#[command(name = "group-sim")]
#[command(about = "Simulate uniform broadcast and reference discovery in one process")]
struct Args {
    /// Path to a YAML config file (defaults are used if it doesn't exist)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of processes, overriding the config file
    #[arg(short, long)]
    processes: Option<u64>,

    /// Number of messages to multicast, overriding the config file
    #[arg(short, long)]
    messages: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,group_core=debug,group_sim=debug"
    } else {
        "info,group_core=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    if let Some(processes) = args.processes {
        config.processes = processes;
    }
    if let Some(messages) = args.messages {
        config.messages = messages;
    }

    info!(
        processes = config.processes,
        messages = config.messages,
        join = config.join,
        "Starting simulation"
    );
    let report = Simulation::new(config)?.run().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

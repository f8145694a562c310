//! arbor-mapper - builds the song-space tree from audio feature exports
//!
//! Examples:
//! ```text
//! arbor-mapper -f data/exported.csv -o output
//! arbor-mapper -s clean -e dr -f data/exported.csv -o output -l 3000
//! arbor-mapper -s dr -e cluster -o output -l 1000
//! arbor-mapper -t preprocess -o output
//! ```
//!
//! A range starting after `clean` reads its input from the output folder.

use anyhow::{Context, Result};
use arbor_common::config::{load_config, resolve_config_path, LoggingConfig};
use arbor_mapper::{Pipeline, RunOptions};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for arbor-mapper
#[derive(Parser, Debug)]
#[command(name = "arbor-mapper")]
#[command(about = "Hierarchical song-space mapping pipeline")]
#[command(version)]
struct Args {
    /// Run a single stage (clean, dr, cluster, branching, metadata, preprocess)
    #[arg(short, long, conflicts_with_all = ["start", "end"])]
    task: Option<String>,

    /// First stage of the range (default: clean)
    #[arg(short, long)]
    start: Option<String>,

    /// Last stage of the range (default: preprocess)
    #[arg(short, long)]
    end: Option<String>,

    /// Feature export CSV for the clean stage
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Output folder (default: mappings_YYYYmmdd_HHMMSS)
    #[arg(short, long)]
    ofolder: Option<PathBuf>,

    /// Maximum number of rows read per input
    #[arg(short, long)]
    limit: Option<usize>,

    /// Config file (overrides ARBOR_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logging depends on the config, so it is loaded first
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!(
        "Starting arbor-mapper v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match resolve_config_path(args.config.as_deref()) {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }

    let options = RunOptions::new(
        args.task.as_deref(),
        args.start.as_deref(),
        args.end.as_deref(),
        args.file,
        args.ofolder,
        args.limit,
    )
    .context("Invalid arguments")?;

    let summary = Pipeline::new(config, options)
        .run()
        .context("Mapping pipeline failed")?;

    info!(
        "Finished {} stage(s), {} leaf clusters, {} model(s) skipped",
        summary.stages.len(),
        summary.leaf_clusters,
        summary.skipped.len()
    );
    Ok(())
}

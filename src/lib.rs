pub mod cli;
pub mod config;
pub mod data;
pub mod encoding;
pub mod error;
pub mod format;
pub mod merge;
pub mod preview;
pub mod reader;
pub mod report;
pub mod schema;
pub mod table;
pub mod writer;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, debug, info, warn};

use crate::{
    cli::{Cli, Commands},
    config::MergeConfig,
    merge::MergeRunStats,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("tabmerge", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Merge(args) => handle_merge(&args),
        Commands::Scan(args) => handle_scan(&args),
        Commands::Preview(args) => preview::execute(&args),
    }
}

fn build_config(args: &cli::MergeArgs) -> Result<MergeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut loaded = MergeConfig::load(path)
                .with_context(|| format!("Loading merge settings from {path:?}"))?;
            if let Some(input) = &args.input {
                loaded.input_directory = input.clone();
            }
            if let Some(output) = &args.output {
                loaded.output_path = output.clone();
            }
            loaded
        }
        None => {
            let input = args
                .input
                .clone()
                .ok_or_else(|| anyhow!("--input is required when no --config file is given"))?;
            let output = args
                .output
                .clone()
                .ok_or_else(|| anyhow!("--output is required when no --config file is given"))?;
            MergeConfig::new(input, output)
        }
    };
    if let Some(chunk_size) = args.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if !args.encodings.is_empty() {
        config = config.with_encodings(&args.encodings);
    }
    if args.no_bom {
        config = config.with_bom(false);
    }
    config.validate()?;
    Ok(config)
}

fn handle_merge(args: &cli::MergeArgs) -> Result<()> {
    let config = build_config(args)?;
    debug!("Merge settings: {:?}", config);
    info!(
        "Merging '{}' into '{}'",
        config.input_directory.display(),
        config.output_path.display()
    );
    match merge::run(&config) {
        Ok(stats) => {
            report::print_summary(&stats);
            write_report(args, &stats)
        }
        Err(abort) => {
            report::print_summary(&abort.stats);
            if let Err(err) = write_report(args, &abort.stats) {
                warn!("{err:#}");
            }
            Err(abort.into())
        }
    }
}

fn write_report(args: &cli::MergeArgs, stats: &MergeRunStats) -> Result<()> {
    if let Some(path) = &args.report {
        report::write_json(stats, path)?;
        info!("Run report written to {:?}", path);
    }
    Ok(())
}

fn handle_scan(args: &cli::ScanArgs) -> Result<()> {
    let worklist = merge::discover(&args.input, None)?;
    print!("{}", report::render_worklist(&worklist));
    info!(
        "{} file(s) in {:?}, {} supported",
        worklist.discovered(),
        args.input,
        worklist.inputs.len()
    );
    Ok(())
}

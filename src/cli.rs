use std::{num::NonZeroUsize, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Merge directories of CSV, Excel, and Stata files into one CSV",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stream every supported file in a directory into a single CSV
    Merge(MergeArgs),
    /// List the files a merge would read and how each would be handled
    Scan(ScanArgs),
    /// Preview the first few rows of a CSV, XLS, XLSX, or DTA file
    Preview(PreviewArgs),
}

#[derive(Debug, Args)]
pub struct MergeArgs {
    /// Directory holding the files to merge (not searched recursively)
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,
    /// Destination CSV file (overwritten)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// YAML file with merge settings; flags given here override it
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// Maximum rows held in memory per batch
    #[arg(long = "chunk-size")]
    pub chunk_size: Option<NonZeroUsize>,
    /// Candidate encoding for text files, tried in the order given (repeatable)
    #[arg(long = "encoding", action = clap::ArgAction::Append)]
    pub encodings: Vec<String>,
    /// Do not write a UTF-8 byte order mark at the start of the output
    #[arg(long = "no-bom")]
    pub no_bom: bool,
    /// Write the per-file run report as JSON to this path
    #[arg(long = "report")]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Directory to list
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    /// Input file to preview
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Number of rows to display
    #[arg(long, default_value_t = 10)]
    pub rows: usize,
    /// Candidate encoding for text files (repeatable; defaults to utf-8, gb18030, windows-1252)
    #[arg(long = "encoding", action = clap::ArgAction::Append)]
    pub encodings: Vec<String>,
}

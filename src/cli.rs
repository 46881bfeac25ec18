//! CLI argument parsing for scbench

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::engine::DEFAULT_TRACKED_CAPACITY;
use crate::report::SortKey;

/// Output format for checkpoint reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    #[default]
    Text,
    /// JSON format for machine parsing
    Json,
    /// CSV format for spreadsheet analysis
    Csv,
}

impl OutputFormat {
    /// File extension for reports written to `--outdir`
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "scbench")]
#[command(version)]
#[command(
    about = "Count system calls and measure their latency, per CPU and without locks",
    long_about = None
)]
pub struct Cli {
    /// Run PROG with ARGS and measure it; must come last
    #[arg(
        short = 'r',
        long = "run",
        value_name = "PROG",
        num_args = 1..,
        allow_hyphen_values = true,
        conflicts_with = "pid"
    )]
    pub run: Option<Vec<String>>,

    /// Measure a running process; with --replay, scope the replay to it
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<u32>,

    /// Feed a recorded JSON-lines event file through the engine
    #[arg(long = "replay", value_name = "FILE", conflicts_with = "run")]
    pub replay: Option<PathBuf>,

    /// Also measure descendants of the measured process
    #[arg(short = 'f', long = "follow")]
    pub follow: bool,

    /// How long to measure, e.g. 90, 5m, "1h 30m" (default: until the program exits or SIGINT)
    #[arg(short = 'd', long = "duration", value_name = "SPEC", num_args = 1..)]
    pub duration: Vec<String>,

    /// Interval between reports, #[s] #m #h #d #w
    #[arg(
        short = 'c',
        long = "checkpoint",
        value_name = "SPEC",
        num_args = 1..,
        default_value = "30m"
    )]
    pub checkpoint: Vec<String>,

    /// Report only what happened since the previous checkpoint
    #[arg(long = "clear")]
    pub clear: bool,

    /// Write reports to DIR/scbench.<n>.<ext> instead of stderr
    #[arg(short = 'o', long = "outdir", value_name = "DIR")]
    pub outdir: Option<PathBuf>,

    /// Replace reports left in --outdir by an earlier run
    #[arg(long = "overwrite", requires = "outdir")]
    pub overwrite: bool,

    /// Print reports to stderr as well as writing them to --outdir
    #[arg(long = "tee", requires = "outdir")]
    pub tee: bool,

    /// Column to order reports by
    #[arg(long = "sort", value_enum, default_value_t = SortKey::AvgOverhead)]
    pub sort: SortKey,

    /// Show syscall numbers in reports
    #[arg(long = "sysnum")]
    pub sysnum: bool,

    /// Report format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Processor replicas to allocate (default: possible CPUs of this machine)
    #[arg(long = "cpus", value_name = "N")]
    pub cpus: Option<usize>,

    /// Maximum number of processes tracked with --follow
    #[arg(long = "max-tracked", value_name = "N", default_value_t = DEFAULT_TRACKED_CAPACITY)]
    pub max_tracked: usize,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

//! CLI argument parsing for Reloj

use clap::{Parser, ValueEnum};

use crate::engine::{SamplerArgs, EVENT_WALL};

/// Output format for collected samples
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Per-thread summary table on stderr (default)
    Text,
    /// One JSON object per sample, written to --output or stdout
    Jsonl,
}

#[derive(Parser, Debug)]
#[command(name = "reloj")]
#[command(version)]
#[command(about = "Wall-clock sampling profiler demo", long_about = None)]
pub struct Cli {
    /// Wall-clock sampling interval in nanoseconds (enables idle sampling)
    #[arg(short = 'w', long = "wall", value_name = "NS")]
    pub wall: Option<i64>,

    /// Fallback sampling interval in nanoseconds when --wall is not given
    #[arg(short = 'i', long = "interval", value_name = "NS", default_value = "0")]
    pub interval: i64,

    /// Event to profile: "wall" (off-CPU inclusive) or "cpu"
    #[arg(short = 'e', long = "event", default_value = EVENT_WALL)]
    pub event: String,

    /// How long to sample the demo workload, in milliseconds
    #[arg(short = 'd', long = "duration", value_name = "MS", default_value = "3000")]
    pub duration_ms: u64,

    /// Number of CPU-spinning workload threads
    #[arg(long = "spinners", value_name = "N", default_value = "2")]
    pub spinners: usize,

    /// Number of syscall-sleeping workload threads
    #[arg(long = "sleepers", value_name = "N", default_value = "2")]
    pub sleepers: usize,

    /// Restrict sampling to the workload threads (enables the thread filter)
    #[arg(long = "filter-workload")]
    pub filter_workload: bool,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Output path for jsonl samples (defaults to stdout)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<std::path::PathBuf>,
}

impl Cli {
    /// Map parsed flags onto engine arguments.
    pub fn sampler_args(&self) -> SamplerArgs {
        SamplerArgs {
            wall_interval: self.wall.unwrap_or(-1),
            default_interval: self.interval,
            event: self.event.clone(),
        }
    }
}

use clap::{Args, Parser, Subcommand};
use idlesnap_controller::BackendKind;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "idlesnap", about = "Energy-aware checkpoint/restore controller", version)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "IDLESNAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Checkpoint backend (docker, criu or simulated)
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run checkpoint, idle, restore cycles and record residency
    Run(RunArgs),
    /// Write a named checkpoint of an instance
    Checkpoint(CheckpointArgs),
    /// Restore an instance from a named checkpoint
    Restore(RestoreArgs),
    /// Record per-core idle-state residency to CSV
    Monitor(MonitorArgs),
    /// Summarise a results directory
    Analyze(AnalyzeArgs),
    /// Parse and summarise a turbostat log
    Turbostat(TurbostatArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Container name (docker) or PID (criu)
    pub name: String,
    pub num_runs: u32,
    pub checkpoint_dir: PathBuf,
    /// Time each cycle stays suspended
    pub idle_seconds: f64,

    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Cores to sample, e.g. 0,1,2
    #[arg(long, value_delimiter = ',')]
    pub cpus: Vec<u32>,

    /// Measure residency without checkpointing for this long first
    #[arg(long)]
    pub baseline_seconds: Option<f64>,

    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub footprint_bytes: u64,

    #[arg(long, default_value_t = 1000)]
    pub restore_sla_ms: u64,
}

#[derive(Args)]
pub struct CheckpointArgs {
    pub instance: String,
    pub dir: PathBuf,

    /// Defaults to a timestamped name
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub leave_running: bool,
}

#[derive(Args)]
pub struct RestoreArgs {
    pub instance: String,
    pub checkpoint_name: String,
    pub dir: PathBuf,
}

#[derive(Args)]
pub struct MonitorArgs {
    /// Cores to sample, e.g. 0,1,2
    pub cpus: CpuList,
    /// Sampling interval in seconds
    pub interval: f64,
    pub out: PathBuf,
    /// Total duration in seconds
    pub duration: f64,

    /// Canonical states to record; defaults to the configured deep idle state
    #[arg(long, value_delimiter = ',')]
    pub states: Vec<String>,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    pub results_dir: PathBuf,

    /// Write a metric,value,unit summary CSV
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Server power in watts for the energy model
    #[arg(long)]
    pub server_power: Option<f64>,
}

#[derive(Args)]
pub struct TurbostatArgs {
    pub logfile: PathBuf,

    #[arg(long, value_delimiter = ',')]
    pub cpus: Vec<u32>,

    /// Write parsed samples as CSV
    #[arg(long)]
    pub export: Option<PathBuf>,
}

/// Comma-separated core list as a single positional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuList(pub Vec<u32>);

impl FromStr for CpuList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<u32>().map_err(|_| format!("invalid cpu: {part}")))
            .collect::<Result<Vec<_>, _>>()
            .map(CpuList)
    }
}

//! CLI for burnin — sustained GPU load with a hard thermal safety net.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "burnin")]
#[command(about = "burnin — GPU burn-in runs with a hard thermal cutoff and JSON reports")]
#[command(version = burnin_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected GPUs (index, name, memory, driver version)
    List,

    /// Run a burn-in: one worker process per device, telemetry sampled once
    /// a second, hard thermal cutoff, JSON report written at the end
    Run {
        /// Comma-separated device indices, or "all"
        #[arg(long, default_value = "all")]
        devices: String,

        /// Stress mode
        #[arg(long, default_value = "compute", value_parser = [
            "compute", "vram", "mix", "pcie", "transient", "nvenc", "training", "precision",
        ])]
        mode: String,

        /// How long to run, e.g. "300", "10m", "2h". Absent or 0 = until Ctrl+C
        #[arg(long)]
        duration: Option<String>,

        /// Abort the run if any device reaches this temperature (°C)
        #[arg(long, default_value = "95")]
        temp_limit: f64,

        /// Telemetry sampling cadence (default 1s)
        #[arg(long)]
        sample_interval: Option<String>,

        /// Snapshot persistence cadence (default 5s)
        #[arg(long)]
        snapshot_interval: Option<String>,

        /// Cooperative worker-join deadline before force-kill (default 10s)
        #[arg(long)]
        shutdown_timeout: Option<String>,

        /// Workload command template; "{index}" is replaced by the device
        /// index. Required for every mode except nvenc, which has a built-in
        /// ffmpeg encode
        #[arg(long)]
        workload_cmd: Option<String>,

        /// Directory the JSON report is written into
        #[arg(long, default_value = ".")]
        output: String,
    },

    /// Worker process entry point (spawned by `burnin run`)
    #[command(hide = true)]
    Worker {
        /// Device index this worker is bound to
        #[arg(long)]
        device: u32,

        /// Stress mode key, for log context
        #[arg(long, default_value = "compute")]
        mode: String,

        /// Workload command template ("{index}" substituted)
        #[arg(long)]
        workload_cmd: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => commands::list::run(),
        Commands::Run {
            devices,
            mode,
            duration,
            temp_limit,
            sample_interval,
            snapshot_interval,
            shutdown_timeout,
            workload_cmd,
            output,
        } => commands::run::run(commands::run::RunCommandConfig {
            devices: &devices,
            mode: &mode,
            duration: duration.as_deref(),
            temp_limit,
            sample_interval: sample_interval.as_deref(),
            snapshot_interval: snapshot_interval.as_deref(),
            shutdown_timeout: shutdown_timeout.as_deref(),
            workload_cmd: workload_cmd.as_deref(),
            output: &output,
        }),
        Commands::Worker {
            device,
            mode,
            workload_cmd,
        } => commands::worker::run(device, &mode, &workload_cmd),
    }
}

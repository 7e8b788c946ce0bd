//! # burnin-core
//!
//! **Sustained GPU load with a hard thermal safety net.**
//!
//! `burnin-core` is the orchestration-and-safety layer for GPU burn-in
//! testing. It spawns one isolated worker process per device, samples
//! telemetry once a second, enforces a thermal cutoff with absolute
//! priority, and writes a structured JSON report of every run, including
//! the ones that end badly.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use burnin_core::{CancelToken, Monitor, RunConfig, SmiReader, StressMode, WorkerCommand};
//!
//! let devices = burnin_core::discover_devices().expect("nvidia-smi");
//!
//! // One worker process per device; `{index}` is substituted at spawn.
//! let worker = WorkerCommand::new(
//!     "burnin",
//!     vec![
//!         "worker".into(), "--device".into(), "{index}".into(),
//!         "--mode".into(), "compute".into(),
//!         "--workload-cmd".into(), "my-kernel --gpu {index}".into(),
//!     ],
//! );
//!
//! let config = RunConfig {
//!     mode: StressMode::Compute,
//!     duration: Some(Duration::from_secs(300)),
//!     ..RunConfig::default()
//! };
//!
//! let monitor = Monitor::new(
//!     devices,
//!     config,
//!     Box::new(SmiReader::new()),
//!     worker,
//!     CancelToken::new(),
//! );
//! let report = monitor.run();
//! burnin_core::save_report(&report, std::path::Path::new(".")).expect("write report");
//! println!("{}", report.result);
//! ```
//!
//! ## Architecture
//!
//! Workload drivers run in worker processes, one per device, so a faulting
//! workload can never take down the monitor or its siblings. The monitor is
//! single-threaded and runs a strict per-tick check order: read telemetry,
//! thermal cutoff, requested duration, operator interrupt, worker/device
//! coverage, snapshot cadence. Cancellation is an explicit set-once
//! [`CancelToken`], carried across the process boundary as SIGTERM.
//!
//! Sampling (default 1 s) is decoupled from snapshot persistence (default
//! 5 s); a thermal abort always snapshots its triggering samples regardless
//! of cadence. Shutdown joins workers cooperatively up to a deadline, then
//! force-kills, and the report is assembled unconditionally either way.

pub mod cancel;
pub mod device;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod report;
pub mod telemetry;
pub mod worker;

pub use cancel::CancelToken;
pub use device::{DeviceInfo, discover_devices, driver_version};
pub use driver::{
    CANCEL_POLL, CommandDriver, SPIN_BATCH_ITERS, SpinDriver, StressMode, WorkloadDriver,
    workload_command,
};
pub use error::{SensorError, SupervisorError};
pub use monitor::{
    DEFAULT_DEVICE_GONE_TICKS, DEFAULT_SAMPLE_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT,
    DEFAULT_SNAPSHOT_INTERVAL, DEFAULT_TEMP_LIMIT_C, Monitor, RunConfig,
};
pub use report::{
    HostInfo, PeakSummary, REPORT_VERSION, Report, RunConfigMeta, RunResult, Snapshot,
    compute_peaks, new_run_id, save_report,
};
pub use telemetry::{FAN_UNAVAILABLE, ScriptedReader, SensorReader, SmiReader, TelemetrySample};
pub use worker::{ShutdownOutcome, WorkerCommand, WorkerExit, WorkerSupervisor};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

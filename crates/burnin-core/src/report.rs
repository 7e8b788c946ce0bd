//! Run reports: document types, peak summaries, JSON persistence.
//!
//! The report is assembled exactly once, at run termination, and is
//! immutable afterwards. Assembly never fails: a run that aborted before
//! its first snapshot still produces a complete document recording what
//! happened, with an empty snapshot list and no peak entries.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::driver::StressMode;
use crate::telemetry::{TelemetrySample, round1};

/// Schema version stamped into every report.
pub const REPORT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

/// Where the run happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub driver_version: Option<String>,
}

impl HostInfo {
    /// Best-effort detection. Never fails; unknown pieces degrade to
    /// placeholders or `None`.
    pub fn detect() -> Self {
        Self {
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            driver_version: crate::device::driver_version(),
        }
    }
}

fn hostname() -> String {
    if let Some(name) = crate::telemetry::run_command("hostname", &[], Duration::from_secs(2)) {
        return name;
    }
    let fallback = fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if fallback.is_empty() {
        "unknown".to_string()
    } else {
        fallback
    }
}

/// The configuration a run was started with, as recorded in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigMeta {
    /// `(index, name)` per tracked device.
    pub devices: Vec<(u32, String)>,
    pub mode: StressMode,
    /// Requested duration in seconds; `0.0` means unlimited.
    pub duration_requested_s: f64,
}

impl RunConfigMeta {
    pub fn new(devices: &[DeviceInfo], mode: StressMode, duration: Option<Duration>) -> Self {
        Self {
            devices: devices.iter().map(|d| (d.index, d.name.clone())).collect(),
            mode,
            duration_requested_s: duration.map(|d| d.as_secs_f64()).unwrap_or(0.0),
        }
    }
}

/// One persisted telemetry snapshot: every device that produced a sample
/// this tick, at most one sample each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: String,
    pub elapsed_s: f64,
    pub devices: Vec<TelemetrySample>,
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Completed,
    UserAborted,
    ThermalAborted { device_index: u32, temp_c: f64 },
    Error { reason: String },
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Completed => write!(f, "completed"),
            RunResult::UserAborted => write!(f, "aborted by user"),
            RunResult::ThermalAborted { device_index, temp_c } => {
                write!(f, "thermal abort: device {device_index} reached {temp_c}°C")
            }
            RunResult::Error { reason } => write!(f, "error: {reason}"),
        }
    }
}

/// Per-device extremes over the recorded snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakSummary {
    pub max_temp_c: f64,
    /// `None` when no recorded sample carried a power reading.
    pub max_power_w: Option<f64>,
    pub max_mem_used_gb: f64,
    pub avg_util_gpu: f64,
}

/// The full run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub version: u32,
    pub run_id: String,
    pub burnin_version: String,
    pub host: HostInfo,
    pub config: RunConfigMeta,
    pub test_started: String,
    pub test_ended: String,
    pub snapshots: Vec<Snapshot>,
    pub result: RunResult,
    pub total_elapsed_s: f64,
    pub device_peaks: BTreeMap<u32, PeakSummary>,
}

impl Report {
    /// Stitch the pieces into the final document. Infallible: an aborted
    /// run with zero snapshots assembles just like a completed one.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        run_id: String,
        config: RunConfigMeta,
        host: HostInfo,
        started_at: SystemTime,
        ended_at: SystemTime,
        total_elapsed: Duration,
        snapshots: Vec<Snapshot>,
        result: RunResult,
    ) -> Self {
        let device_peaks = compute_peaks(&snapshots);
        Self {
            version: REPORT_VERSION,
            run_id,
            burnin_version: crate::VERSION.to_string(),
            host,
            config,
            test_started: format_iso8601(
                started_at.duration_since(UNIX_EPOCH).unwrap_or_default(),
            ),
            test_ended: format_iso8601(ended_at.duration_since(UNIX_EPOCH).unwrap_or_default()),
            snapshots,
            result,
            total_elapsed_s: round1(total_elapsed.as_secs_f64()),
            device_peaks,
        }
    }
}

/// Mint a fresh run id.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Peak computation
// ---------------------------------------------------------------------------

/// Per-device maxima and mean utilization over the recorded snapshots.
///
/// Pure and repeatable: the same snapshots always yield the same map.
/// Devices with zero recorded samples get no entry at all, and the fan
/// sentinel never participates (fan is not summarized).
pub fn compute_peaks(snapshots: &[Snapshot]) -> BTreeMap<u32, PeakSummary> {
    let mut by_device: BTreeMap<u32, Vec<&TelemetrySample>> = BTreeMap::new();
    for snap in snapshots {
        for sample in &snap.devices {
            by_device.entry(sample.index).or_default().push(sample);
        }
    }

    by_device
        .into_iter()
        .map(|(index, samples)| {
            let max_temp_c = samples.iter().map(|s| s.temp_c).fold(f64::MIN, f64::max);
            let max_power_w = samples
                .iter()
                .filter_map(|s| s.power_w)
                .fold(None, |best: Option<f64>, p| {
                    Some(best.map_or(p, |b| b.max(p)))
                });
            let max_mem_used_gb = samples
                .iter()
                .map(|s| s.mem_used_gb)
                .fold(f64::MIN, f64::max);
            let avg_util_gpu = round1(
                samples.iter().map(|s| f64::from(s.util_gpu_pct)).sum::<f64>()
                    / samples.len() as f64,
            );
            (
                index,
                PeakSummary {
                    max_temp_c,
                    max_power_w,
                    max_mem_used_gb,
                    avg_util_gpu,
                },
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Write the report as pretty-printed JSON into `dir`, creating it if
/// needed. The filename carries a compact UTC timestamp.
pub fn save_report(report: &Report, dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let path = dir.join(format!("burnin_report_{}.json", compact_timestamp(ts)));
    let json = serde_json::to_string_pretty(report).map_err(io::Error::other)?;
    fs::write(&path, json)?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Format a duration-since-epoch as an ISO-8601 timestamp.
/// Example: `2026-08-25T01:30:00Z`
pub(crate) fn format_iso8601(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day, hour, min, sec) = secs_to_utc(secs);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

/// Compact timestamp for report filenames. Example: `20260825_013000`
fn compact_timestamp(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day, hour, min, sec) = secs_to_utc(secs);
    format!("{year:04}{month:02}{day:02}_{hour:02}{min:02}{sec:02}")
}

/// Convert seconds since Unix epoch to (year, month, day, hour, minute,
/// second) UTC. Simple implementation — no leap second handling.
fn secs_to_utc(secs: u64) -> (u64, u64, u64, u64, u64, u64) {
    let sec = secs % 60;
    let min = (secs / 60) % 60;
    let hour = (secs / 3600) % 24;

    let mut days = secs / 86400;
    let mut year = 1970u64;

    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let months_days: [u64; 12] = if is_leap(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 0u64;
    for (i, &md) in months_days.iter().enumerate() {
        if days < md {
            month = i as u64 + 1;
            break;
        }
        days -= md;
    }
    let day = days + 1;

    (year, month, day, hour, min, sec)
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

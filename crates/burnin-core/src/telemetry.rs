//! Per-device telemetry sampling.
//!
//! Reads are intentionally operational:
//! - side-effect-free, never panicking on backend trouble,
//! - per-field: an unsupported fan or power sensor does not spoil a
//!   perfectly good temperature reading,
//! - absent values stay absent (`None` or the fan sentinel), never a silent
//!   zero a downstream average would swallow.
//!
//! The production backend shells out to `nvidia-smi` with a hard timeout and
//! parses its CSV output. Anything that can fail for one tick yields a
//! [`SensorError::Transient`], which the monitor absorbs as "no sample this
//! tick".

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::error::SensorError;

/// Fan value recorded when the backend cannot measure fan speed (laptops,
/// passive and water-cooled boards). Distinct from a real 0 %: renderers must
/// draw it as "n/a" and averages must skip it.
pub const FAN_UNAVAILABLE: i32 = -1;

/// Hard ceiling on one sampling query; a wedged driver stalls the tick, not
/// the run.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fields requested per sample, in parse order.
const QUERY_FIELDS: &str = "temperature.gpu,power.draw,power.limit,clocks.gr,clocks.mem,\
                            utilization.gpu,utilization.memory,memory.used,memory.total,fan.speed";

// ---------------------------------------------------------------------------
// Sample model
// ---------------------------------------------------------------------------

/// One telemetry read for one device.
///
/// Temperature, utilization, and memory are required: a read that cannot
/// produce them fails as a whole and the device is simply absent from that
/// tick. Power and clocks are optional per-field; fan uses
/// [`FAN_UNAVAILABLE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub index: u32,
    pub name: String,
    pub temp_c: f64,
    pub power_w: Option<f64>,
    pub power_limit_w: Option<f64>,
    pub clock_core_mhz: Option<u32>,
    pub clock_mem_mhz: Option<u32>,
    pub util_gpu_pct: u32,
    pub util_mem_pct: u32,
    pub mem_used_gb: f64,
    pub mem_total_gb: f64,
    pub mem_used_pct: f64,
    pub fan_pct: i32,
}

impl TelemetrySample {
    /// Fabricate a plausible sample at the given temperature. For scripted
    /// readers in tests and rehearsals.
    pub fn mock(index: u32, temp_c: f64) -> Self {
        Self {
            index,
            name: format!("Mock GPU {index}"),
            temp_c,
            power_w: Some(320.5),
            power_limit_w: Some(450.0),
            clock_core_mhz: Some(2520),
            clock_mem_mhz: Some(10501),
            util_gpu_pct: 99,
            util_mem_pct: 87,
            mem_used_gb: 20.11,
            mem_total_gb: 24.0,
            mem_used_pct: 83.8,
            fan_pct: 65,
        }
    }
}

// ---------------------------------------------------------------------------
// Reader contract
// ---------------------------------------------------------------------------

/// Instantaneous telemetry for one device.
///
/// Implementations must be side-effect-free and must not panic on transient
/// backend errors; a failed read degrades to "no sample this tick" rather
/// than destabilizing the run.
pub trait SensorReader: Send {
    fn sample(&self, device: &DeviceInfo) -> Result<TelemetrySample, SensorError>;
}

/// Production backend: one short-lived `nvidia-smi` query per device per
/// tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmiReader;

impl SmiReader {
    pub fn new() -> Self {
        Self
    }
}

impl SensorReader for SmiReader {
    fn sample(&self, device: &DeviceInfo) -> Result<TelemetrySample, SensorError> {
        let index_arg = device.index.to_string();
        let query = format!("--query-gpu={QUERY_FIELDS}");
        let raw = run_command(
            "nvidia-smi",
            &[&query, "--format=csv,noheader,nounits", "-i", &index_arg],
            SAMPLE_TIMEOUT,
        )
        .ok_or_else(|| SensorError::Transient {
            device: device.index,
            reason: "nvidia-smi produced no output".to_string(),
        })?;

        parse_sample_line(device, raw.lines().next().unwrap_or(""))
    }
}

/// Scripted reader: pops one pre-arranged result per device per call,
/// repeating the final entry once a script runs out. Lets tests drive the
/// monitor through exact telemetry sequences without hardware.
#[derive(Default)]
pub struct ScriptedReader {
    scripts: Mutex<HashMap<u32, VecDeque<Result<TelemetrySample, SensorError>>>>,
}

impl ScriptedReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the results `device` will report, in order. The last entry
    /// repeats forever.
    pub fn script(
        self,
        device: u32,
        results: Vec<Result<TelemetrySample, SensorError>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(device, results.into());
        self
    }
}

impl SensorReader for ScriptedReader {
    fn sample(&self, device: &DeviceInfo) -> Result<TelemetrySample, SensorError> {
        let mut scripts = self.scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(&device.index) else {
            return Err(SensorError::Transient {
                device: device.index,
                reason: "no scripted telemetry for this device".to_string(),
            });
        };
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        next.unwrap_or(Err(SensorError::Transient {
            device: device.index,
            reason: "script exhausted".to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// CSV parsing
// ---------------------------------------------------------------------------

/// Parse one `nvidia-smi` CSV line into a sample. Each field parses
/// independently; `[N/A]`-style placeholders simply fail their own field.
fn parse_sample_line(device: &DeviceInfo, line: &str) -> Result<TelemetrySample, SensorError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 10 {
        return Err(SensorError::Transient {
            device: device.index,
            reason: format!("expected 10 telemetry fields, got {}", fields.len()),
        });
    }

    let required_f64 = |i: usize, what: &str| -> Result<f64, SensorError> {
        fields[i].parse::<f64>().map_err(|_| SensorError::Transient {
            device: device.index,
            reason: format!("unreadable {what} '{}'", fields[i]),
        })
    };
    let required_u32 = |i: usize, what: &str| -> Result<u32, SensorError> {
        fields[i].parse::<u32>().map_err(|_| SensorError::Transient {
            device: device.index,
            reason: format!("unreadable {what} '{}'", fields[i]),
        })
    };

    let temp_c = required_f64(0, "temperature")?;
    let util_gpu_pct = required_u32(5, "gpu utilization")?;
    let util_mem_pct = required_u32(6, "memory-bus utilization")?;
    let mem_used_gb = round2(required_f64(7, "memory used")? / 1024.0);
    let mem_total_gb = round2(required_f64(8, "memory total")? / 1024.0);
    let mem_used_pct = if mem_total_gb > 0.0 {
        round1(mem_used_gb / mem_total_gb * 100.0)
    } else {
        0.0
    };

    Ok(TelemetrySample {
        index: device.index,
        name: device.name.clone(),
        temp_c,
        power_w: fields[1].parse::<f64>().ok().map(round1),
        power_limit_w: fields[2].parse::<f64>().ok().map(f64::round),
        clock_core_mhz: fields[3].parse::<u32>().ok(),
        clock_mem_mhz: fields[4].parse::<u32>().ok(),
        util_gpu_pct,
        util_mem_pct,
        mem_used_gb,
        mem_total_gb,
        mem_used_pct,
        fan_pct: fields[9].parse::<i32>().unwrap_or(FAN_UNAVAILABLE),
    })
}

pub(crate) fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Subprocess helper
// ---------------------------------------------------------------------------

/// Run a command with a hard deadline and capture trimmed stdout. `None` on
/// spawn failure, non-zero exit, timeout, or empty output.
pub(crate) fn run_command(cmd: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = std::process::Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return None;
                }
                let mut out = Vec::new();
                if let Some(mut stdout) = child.stdout.take() {
                    let _ = stdout.read_to_end(&mut out);
                }
                let s = String::from_utf8_lossy(&out).trim().to_string();
                return if s.is_empty() { None } else { Some(s) };
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

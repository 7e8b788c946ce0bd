//! Device descriptors and discovery.
//!
//! Discovery runs once at startup; the resulting [`DeviceInfo`] set is
//! immutable for the run's lifetime. Everything goes through `nvidia-smi`
//! rather than a driver binding, which keeps the harness working on any box
//! where the vendor tools are installed and degrades to an empty device list
//! everywhere else.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::telemetry::run_command;

/// How long a discovery query may take. First contact with the driver can be
/// slow on a cold machine, so this is far looser than the per-tick sampling
/// timeout.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One accelerator device targeted by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable index within the run, as reported by the driver.
    pub index: u32,
    /// Marketing name, e.g. `NVIDIA GeForce RTX 4090`.
    pub name: String,
    /// Total memory capacity in GiB.
    pub mem_total_gb: f64,
}

/// Enumerate installed devices.
///
/// Returns an error only when `nvidia-smi` itself is unavailable or produced
/// nothing; a machine with the tools but no devices yields an empty list.
pub fn discover_devices() -> io::Result<Vec<DeviceInfo>> {
    let raw = run_command(
        "nvidia-smi",
        &[
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ],
        DISCOVERY_TIMEOUT,
    )
    .ok_or_else(|| {
        io::Error::other("nvidia-smi unavailable or returned no output; is the driver installed?")
    })?;

    Ok(raw.lines().filter_map(parse_device_line).collect())
}

/// Installed driver version, for report context. Best-effort.
pub fn driver_version() -> Option<String> {
    let raw = run_command(
        "nvidia-smi",
        &["--query-gpu=driver_version", "--format=csv,noheader"],
        DISCOVERY_TIMEOUT,
    )?;
    raw.lines().next().map(|l| l.trim().to_string())
}

/// Parse one `index, name, memory.total` CSV line. Memory arrives in MiB.
fn parse_device_line(line: &str) -> Option<DeviceInfo> {
    let mut parts = line.split(',').map(str::trim);
    let index = parts.next()?.parse().ok()?;
    let name = parts.next()?;
    let mem_mib: f64 = parts.next()?.parse().ok()?;
    if name.is_empty() {
        return None;
    }
    Some(DeviceInfo {
        index,
        name: name.to_string(),
        mem_total_gb: (mem_mib / 1024.0 * 100.0).round() / 100.0,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

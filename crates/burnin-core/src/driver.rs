//! Stress modes and the workload driver seam.
//!
//! A driver keeps one device busy until cancellation. The harness never
//! inspects what a driver does; it only requires the latency contract: the
//! cancellation token is observed between bounded batches of work, so
//! abort-to-idle stays well under the sampling interval.
//!
//! [`CommandDriver`] is the production driver: it supervises an external
//! workload command bound to the device, relaunching it if it exits while
//! the run is live. [`SpinDriver`] is the in-process reference driver used
//! to exercise the seam without hardware.

use std::fmt;
use std::io;
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::SupervisorError;

/// How often [`CommandDriver`] polls its child and the cancellation token.
/// Bounds the abort-to-idle latency for subprocess workloads.
pub const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Work dispatched by [`SpinDriver`] between token checks.
pub const SPIN_BATCH_ITERS: u32 = 50;

/// Grace given to a workload child between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Built-in workload for [`StressMode::Nvenc`]: synthesize 4K test video and
/// hard-encode it to null on the device's encoder.
const NVENC_TEMPLATE: &str = "ffmpeg -y -hwaccel cuda -hwaccel_device {index} \
                              -f lavfi -i testsrc=duration=3600:size=3840x2160:rate=60 \
                              -c:v h264_nvenc -preset p6 -tune hq -b:v 50M -f null -";

// ---------------------------------------------------------------------------
// Stress modes
// ---------------------------------------------------------------------------

/// The workload families a run can request. The mode picks the workload
/// command and is stamped into the report; the harness itself treats every
/// mode identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StressMode {
    Compute,
    Vram,
    Mix,
    Pcie,
    Transient,
    Nvenc,
    Training,
    Precision,
}

impl StressMode {
    pub const ALL: [StressMode; 8] = [
        StressMode::Compute,
        StressMode::Vram,
        StressMode::Mix,
        StressMode::Pcie,
        StressMode::Transient,
        StressMode::Nvenc,
        StressMode::Training,
        StressMode::Precision,
    ];

    /// Stable config/report key.
    pub fn key(self) -> &'static str {
        match self {
            StressMode::Compute => "compute",
            StressMode::Vram => "vram",
            StressMode::Mix => "mix",
            StressMode::Pcie => "pcie",
            StressMode::Transient => "transient",
            StressMode::Nvenc => "nvenc",
            StressMode::Training => "training",
            StressMode::Precision => "precision",
        }
    }

    /// Human label for listings and summaries.
    pub fn label(self) -> &'static str {
        match self {
            StressMode::Compute => "Compute",
            StressMode::Vram => "VRAM",
            StressMode::Mix => "Mixed",
            StressMode::Pcie => "PCIe/NVLink",
            StressMode::Transient => "Transient",
            StressMode::Nvenc => "Video/NVENC",
            StressMode::Training => "AI Training",
            StressMode::Precision => "Precision",
        }
    }
}

impl fmt::Display for StressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for StressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StressMode::ALL
            .iter()
            .copied()
            .find(|m| m.key() == s)
            .ok_or_else(|| {
                let keys: Vec<&str> = StressMode::ALL.iter().map(|m| m.key()).collect();
                format!("unknown stress mode '{s}' (expected one of: {})", keys.join(", "))
            })
    }
}

/// Resolve the workload command template for a mode. An explicit override
/// always wins; `nvenc` has a built-in fallback; every other mode requires
/// an explicit command and fails before anything is spawned.
pub fn workload_command(
    mode: StressMode,
    override_cmd: Option<&str>,
) -> Result<String, SupervisorError> {
    if let Some(cmd) = override_cmd {
        return Ok(cmd.to_string());
    }
    match mode {
        StressMode::Nvenc => Ok(NVENC_TEMPLATE.to_string()),
        _ => Err(SupervisorError::NoWorkloadCommand {
            mode: mode.key().to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Driver contract
// ---------------------------------------------------------------------------

/// Keeps one device busy until cancellation.
///
/// `run` must block until `token` trips, then return `Ok(())` promptly.
/// Returning before cancellation is a fault the worker entry point turns
/// into a non-zero exit; an `Err` is a driver failure.
pub trait WorkloadDriver {
    fn run(&self, device_index: u32, token: &CancelToken) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// CommandDriver
// ---------------------------------------------------------------------------

/// Supervises an external workload command bound to one device.
///
/// The argv template may carry `{index}` placeholders, substituted with the
/// device index at launch. While the run is live the child is relaunched if
/// it exits; on cancellation it is terminated (SIGTERM, then SIGKILL after
/// [`TERM_GRACE`]).
#[derive(Debug, Clone)]
pub struct CommandDriver {
    argv: Vec<String>,
}

impl CommandDriver {
    pub fn new(argv: Vec<String>) -> io::Result<Self> {
        if argv.is_empty() || argv[0].is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty workload command",
            ));
        }
        Ok(Self { argv })
    }

    /// Build from a whitespace-separated command template.
    pub fn from_template(template: &str) -> io::Result<Self> {
        Self::new(template.split_whitespace().map(str::to_string).collect())
    }
}

impl WorkloadDriver for CommandDriver {
    fn run(&self, device_index: u32, token: &CancelToken) -> io::Result<()> {
        let argv = substitute_index(&self.argv, device_index);
        let mut child = spawn_quiet(&argv)?;
        while !token.is_cancelled() {
            if let Some(status) = child.try_wait()? {
                warn!("workload for device {device_index} exited ({status}); relaunching");
                child = spawn_quiet(&argv)?;
            }
            std::thread::sleep(CANCEL_POLL);
        }
        terminate(&mut child);
        Ok(())
    }
}

fn substitute_index(argv: &[String], index: u32) -> Vec<String> {
    let index = index.to_string();
    argv.iter().map(|arg| arg.replace("{index}", &index)).collect()
}

fn spawn_quiet(argv: &[String]) -> io::Result<Child> {
    Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

/// Cooperative stop, escalating to SIGKILL after [`TERM_GRACE`].
#[cfg(unix)]
fn terminate(child: &mut Child) {
    // SAFETY: the pid belongs to a child we own and have not yet waited on;
    // signalling a reaped-elsewhere pid is impossible here.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

// ---------------------------------------------------------------------------
// SpinDriver
// ---------------------------------------------------------------------------

/// In-process reference driver: arithmetic busy-work in batches of
/// [`SPIN_BATCH_ITERS`], the token checked only between batches. Pins down
/// the batch-checked cancellation contract without touching hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinDriver;

impl WorkloadDriver for SpinDriver {
    fn run(&self, device_index: u32, token: &CancelToken) -> io::Result<()> {
        let mut acc = u64::from(device_index).wrapping_add(0x9e37_79b9_7f4a_7c15);
        while !token.is_cancelled() {
            acc = spin_batch(acc);
        }
        Ok(())
    }
}

fn spin_batch(mut acc: u64) -> u64 {
    for _ in 0..SPIN_BATCH_ITERS {
        for _ in 0..1024 {
            acc = acc
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
        }
        std::hint::black_box(acc);
    }
    acc
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Mode tests
    // -----------------------------------------------------------------------

    #[test]
    fn every_mode_round_trips_through_its_key() {
        for mode in StressMode::ALL {
            assert_eq!(mode.key().parse::<StressMode>(), Ok(mode));
            assert_eq!(mode.to_string(), mode.key());
        }
    }

    #[test]
    fn unknown_mode_keys_are_rejected_with_the_catalogue() {
        let err = "warp".parse::<StressMode>().unwrap_err();
        assert!(err.contains("'warp'"));
        assert!(err.contains("nvenc"));
    }

    #[test]
    fn modes_serialize_as_bare_keys() {
        let json = serde_json::to_string(&StressMode::Pcie).unwrap();
        assert_eq!(json, "\"pcie\"");
        let back: StressMode = serde_json::from_str("\"training\"").unwrap();
        assert_eq!(back, StressMode::Training);
    }

    // -----------------------------------------------------------------------
    // Workload command resolution
    // -----------------------------------------------------------------------

    #[test]
    fn explicit_command_wins_over_the_builtin() {
        let cmd = workload_command(StressMode::Nvenc, Some("my-encoder --gpu {index}")).unwrap();
        assert_eq!(cmd, "my-encoder --gpu {index}");
    }

    #[test]
    fn nvenc_falls_back_to_the_ffmpeg_template() {
        let cmd = workload_command(StressMode::Nvenc, None).unwrap();
        assert!(cmd.contains("h264_nvenc"));
        assert!(cmd.contains("{index}"));
    }

    #[test]
    fn other_modes_require_an_explicit_command() {
        let err = workload_command(StressMode::Compute, None).unwrap_err();
        assert!(err.to_string().contains("'compute'"));
    }

    #[test]
    fn index_substitution_touches_every_placeholder() {
        let argv = vec![
            "run".to_string(),
            "--gpu".to_string(),
            "{index}".to_string(),
            "--tag".to_string(),
            "dev{index}".to_string(),
        ];
        let out = substitute_index(&argv, 3);
        assert_eq!(out, vec!["run", "--gpu", "3", "--tag", "dev3"]);
    }

    #[test]
    fn empty_templates_are_rejected() {
        assert!(CommandDriver::from_template("").is_err());
        assert!(CommandDriver::from_template("   ").is_err());
    }

    // -----------------------------------------------------------------------
    // Driver behaviour
    // -----------------------------------------------------------------------

    #[test]
    fn spin_driver_stops_within_a_batch_of_cancellation() {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let handle = std::thread::spawn(move || SpinDriver.run(0, &worker_token));

        std::thread::sleep(Duration::from_millis(50));
        token.cancel();

        let start = Instant::now();
        handle.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn command_driver_terminates_its_child_on_cancel() {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let driver = CommandDriver::from_template("sleep 30").unwrap();
        let handle = std::thread::spawn(move || driver.run(0, &worker_token));

        std::thread::sleep(Duration::from_millis(300));
        token.cancel();

        let start = Instant::now();
        handle.join().unwrap().unwrap();
        // sleep dies to SIGTERM, well inside the grace window.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn command_driver_relaunches_an_early_exiting_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("launches");
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo run >> {}", marker.display()),
        ];

        let token = CancelToken::new();
        let worker_token = token.clone();
        let driver = CommandDriver::new(argv).unwrap();
        let handle = std::thread::spawn(move || driver.run(0, &worker_token));

        // Long enough for several poll periods to notice the instant exits.
        std::thread::sleep(Duration::from_millis(900));
        token.cancel();
        handle.join().unwrap().unwrap();

        let launches = std::fs::read_to_string(&marker).unwrap();
        assert!(
            launches.lines().count() >= 2,
            "expected at least one relaunch, saw {}",
            launches.lines().count()
        );
    }
}

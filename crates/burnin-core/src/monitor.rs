//! The monitoring loop: fixed-cadence sampling, the thermal cutoff, and the
//! run's termination state machine.
//!
//! The monitor is single-threaded and owns the snapshot sequence outright;
//! workers only ever see the cancellation token. Each tick runs a strict
//! check order: read telemetry, thermal safety (absolute priority), duration,
//! operator interrupt, worker/device coverage, then the cadenced snapshot.
//! Whatever terminates the run, shutdown is cooperative-then-forced and the
//! report is assembled unconditionally.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::device::DeviceInfo;
use crate::driver::StressMode;
use crate::error::SensorError;
use crate::report::{
    HostInfo, Report, RunConfigMeta, RunResult, Snapshot, format_iso8601, new_run_id,
};
use crate::telemetry::{SensorReader, TelemetrySample, round1};
use crate::worker::{WorkerCommand, WorkerSupervisor};

pub const DEFAULT_TEMP_LIMIT_C: f64 = 95.0;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DEVICE_GONE_TICKS: u32 = 10;

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: StressMode,
    /// `None` runs until aborted.
    pub duration: Option<Duration>,
    /// Any device at or above this temperature aborts the run.
    pub temp_limit_c: f64,
    /// Telemetry cadence; every safety decision is made at this rate.
    pub sample_interval: Duration,
    /// Persistence cadence, deliberately coarser than sampling.
    pub snapshot_interval: Duration,
    /// Cooperative-join deadline before stragglers are force-killed.
    pub shutdown_timeout: Duration,
    /// Consecutive failed reads before a device is declared gone.
    pub device_gone_ticks: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: StressMode::Compute,
            duration: None,
            temp_limit_c: DEFAULT_TEMP_LIMIT_C,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            device_gone_ticks: DEFAULT_DEVICE_GONE_TICKS,
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Drives one run end to end: worker bring-up, the tick loop, teardown,
/// report assembly.
pub struct Monitor {
    devices: Vec<DeviceInfo>,
    config: RunConfig,
    reader: Box<dyn SensorReader>,
    worker_command: WorkerCommand,
    interrupt: CancelToken,
}

impl Monitor {
    /// `interrupt` is the operator-side token (Ctrl-C); the workers get
    /// their own token, created and broadcast by the supervisor.
    pub fn new(
        devices: Vec<DeviceInfo>,
        config: RunConfig,
        reader: Box<dyn SensorReader>,
        worker_command: WorkerCommand,
        interrupt: CancelToken,
    ) -> Self {
        Self {
            devices,
            config,
            reader,
            worker_command,
            interrupt,
        }
    }

    /// Run to completion. Always returns a report, whatever happened: a
    /// spawn failure, a thermal abort at the first tick, and a full
    /// requested duration all end in an assembled document.
    pub fn run(self) -> Report {
        let run_id = new_run_id();
        let host = HostInfo::detect();
        let config_meta =
            RunConfigMeta::new(&self.devices, self.config.mode, self.config.duration);
        let started_at = SystemTime::now();
        let t0 = Instant::now();

        info!(
            "run {run_id} starting: {} device(s), mode {}, limit {}°C",
            self.devices.len(),
            self.config.mode,
            self.config.temp_limit_c
        );

        let mut supervisor = match WorkerSupervisor::start(
            &self.devices,
            &self.worker_command,
            CancelToken::new(),
        ) {
            Ok(sup) => sup,
            Err(err) => {
                error!("{err}");
                return Report::assemble(
                    run_id,
                    config_meta,
                    host,
                    started_at,
                    SystemTime::now(),
                    t0.elapsed(),
                    Vec::new(),
                    RunResult::Error { reason: err.to_string() },
                );
            }
        };

        let mut snapshots: Vec<Snapshot> = Vec::new();
        let mut misses: BTreeMap<u32, u32> = BTreeMap::new();
        let mut last_snapshot = Instant::now();

        let result = loop {
            let tick_started = Instant::now();

            // 1. Read telemetry for every tracked device. Failures are
            //    per-device and per-tick; only the consecutive count sticks.
            let mut samples: Vec<TelemetrySample> = Vec::with_capacity(self.devices.len());
            for device in &self.devices {
                match self.reader.sample(device) {
                    Ok(sample) => {
                        misses.insert(device.index, 0);
                        samples.push(sample);
                    }
                    Err(err) => {
                        let count = misses.entry(device.index).or_insert(0);
                        *count += 1;
                        debug!("{err} ({count} consecutive)");
                    }
                }
            }
            let elapsed = t0.elapsed();

            // 2. Thermal safety, absolute priority. First device at or over
            //    the limit names the result; the triggering samples are
            //    snapshotted regardless of cadence.
            if let Some(hot) = samples.iter().find(|s| s.temp_c >= self.config.temp_limit_c) {
                let (device_index, temp_c) = (hot.index, hot.temp_c);
                error!(
                    "device {device_index} at {temp_c}°C (limit {}°C); aborting",
                    self.config.temp_limit_c
                );
                supervisor.signal_cancel();
                snapshots.push(make_snapshot(elapsed, samples));
                break RunResult::ThermalAborted { device_index, temp_c };
            }

            // 3. Requested duration.
            if let Some(limit) = self.config.duration
                && elapsed >= limit
            {
                info!("requested duration reached");
                break RunResult::Completed;
            }

            // 4. Operator interrupt.
            if self.interrupt.is_cancelled() {
                info!("interrupt received; stopping");
                break RunResult::UserAborted;
            }

            // 5. Coverage. A worker death without cancellation means a
            //    silently idle device; a sensor blackout past the threshold
            //    means the device itself is gone.
            let exits = supervisor.reap_unexpected();
            if let Some(exit) = exits.first() {
                let reason = format!(
                    "worker for device {} exited unexpectedly ({})",
                    exit.device_index, exit.status
                );
                error!("{reason}");
                break RunResult::Error { reason };
            }
            if let Some(device) = misses
                .iter()
                .find(|(_, count)| **count >= self.config.device_gone_ticks)
                .map(|(device, _)| *device)
            {
                let reason = SensorError::DeviceGone { device }.to_string();
                error!("{reason}");
                break RunResult::Error { reason };
            }

            // 6. Cadenced snapshot.
            if tick_started.duration_since(last_snapshot) >= self.config.snapshot_interval {
                debug!(
                    "snapshot at {:.1}s ({} of {} device(s) sampled)",
                    elapsed.as_secs_f64(),
                    samples.len(),
                    self.devices.len()
                );
                snapshots.push(make_snapshot(elapsed, samples));
                last_snapshot = tick_started;
            }

            self.sleep_remainder(tick_started);
        };

        // Captured before teardown so a slow worker exit never inflates the
        // recorded duration.
        let ended_at = SystemTime::now();
        let total_elapsed = t0.elapsed();

        let outcome = supervisor.shutdown(self.config.shutdown_timeout);
        if outcome.forced > 0 {
            warn!("{} worker(s) force-killed during shutdown", outcome.forced);
        }

        let report = Report::assemble(
            run_id,
            config_meta,
            host,
            started_at,
            ended_at,
            total_elapsed,
            snapshots,
            result,
        );
        info!(
            "run {} finished: {} ({} snapshot(s), {:.1}s)",
            report.run_id,
            report.result,
            report.snapshots.len(),
            report.total_elapsed_s
        );
        report
    }

    /// Sleep out the rest of the tick in small slices, waking early if the
    /// interrupt trips. The early tick still runs the full check order, so
    /// safety is evaluated on fresh data before the abort is honoured.
    fn sleep_remainder(&self, tick_started: Instant) {
        let deadline = tick_started + self.config.sample_interval;
        loop {
            let now = Instant::now();
            if now >= deadline || self.interrupt.is_cancelled() {
                return;
            }
            let left = deadline.duration_since(now);
            std::thread::sleep(left.min(Duration::from_millis(10)));
        }
    }
}

fn make_snapshot(elapsed: Duration, samples: Vec<TelemetrySample>) -> Snapshot {
    Snapshot {
        timestamp: format_iso8601(
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
        ),
        elapsed_s: round1(elapsed.as_secs_f64()),
        devices: samples,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ScriptedReader;

    fn devices(n: u32) -> Vec<DeviceInfo> {
        (0..n)
            .map(|index| DeviceInfo {
                index,
                name: format!("Mock GPU {index}"),
                mem_total_gb: 24.0,
            })
            .collect()
    }

    fn sleeper() -> WorkerCommand {
        WorkerCommand::new("sleep", vec!["30".to_string()])
    }

    /// Tight cadences so a whole run fits in a fraction of a second. The
    /// 10 s duration is a safety net individual tests override.
    fn fast_config() -> RunConfig {
        RunConfig {
            duration: Some(Duration::from_secs(10)),
            sample_interval: Duration::from_millis(20),
            snapshot_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            ..RunConfig::default()
        }
    }

    fn steady(index: u32, temp_c: f64) -> Vec<Result<TelemetrySample, SensorError>> {
        vec![Ok(TelemetrySample::mock(index, temp_c))]
    }

    #[cfg(unix)]
    #[test]
    fn completes_after_the_requested_duration() {
        let reader = ScriptedReader::new().script(0, steady(0, 60.0));
        let config = RunConfig {
            duration: Some(Duration::from_millis(150)),
            snapshot_interval: Duration::from_millis(40),
            ..fast_config()
        };
        let report = Monitor::new(
            devices(1),
            config,
            Box::new(reader),
            sleeper(),
            CancelToken::new(),
        )
        .run();

        assert_eq!(report.result, RunResult::Completed);
        assert!(!report.snapshots.is_empty());
        // Snapshots are elapsed-ordered.
        for pair in report.snapshots.windows(2) {
            assert!(pair[0].elapsed_s <= pair[1].elapsed_s);
        }
        assert!(report.device_peaks.contains_key(&0));
    }

    #[cfg(unix)]
    #[test]
    fn thermal_abort_names_the_first_hot_device_and_keeps_the_evidence() {
        // Device 0 ramps to 96 °C on its tenth read; device 1 stays cool.
        let mut hot_script: Vec<_> = (0..9).map(|_| Ok(TelemetrySample::mock(0, 70.0))).collect();
        hot_script.push(Ok(TelemetrySample::mock(0, 96.0)));
        let reader = ScriptedReader::new()
            .script(0, hot_script)
            .script(1, steady(1, 70.0));

        let report = Monitor::new(
            devices(2),
            fast_config(),
            Box::new(reader),
            sleeper(),
            CancelToken::new(),
        )
        .run();

        assert_eq!(
            report.result,
            RunResult::ThermalAborted { device_index: 0, temp_c: 96.0 }
        );
        // The triggering tick was snapshotted despite the 60 s cadence, and
        // nothing was appended after it.
        assert_eq!(report.snapshots.len(), 1);
        let last = report.snapshots.last().unwrap();
        let mut seen: Vec<u32> = last.devices.iter().map(|s| s.index).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
        assert!((report.device_peaks[&0].max_temp_c - 96.0).abs() < f64::EPSILON);
    }

    #[cfg(unix)]
    #[test]
    fn a_pre_tripped_interrupt_aborts_before_any_snapshot() {
        let reader = ScriptedReader::new().script(0, steady(0, 60.0));
        let interrupt = CancelToken::new();
        interrupt.cancel();

        let config = RunConfig { duration: None, ..fast_config() };
        let report = Monitor::new(
            devices(1),
            config,
            Box::new(reader),
            sleeper(),
            interrupt,
        )
        .run();

        assert_eq!(report.result, RunResult::UserAborted);
        assert!(report.snapshots.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn an_interrupt_mid_run_wakes_the_loop_early() {
        let reader = ScriptedReader::new().script(0, steady(0, 60.0));
        let interrupt = CancelToken::new();
        let tripper = interrupt.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            tripper.cancel();
        });

        let config = RunConfig {
            duration: None,
            sample_interval: Duration::from_secs(30),
            ..fast_config()
        };
        let start = Instant::now();
        let report = Monitor::new(
            devices(1),
            config,
            Box::new(reader),
            sleeper(),
            interrupt,
        )
        .run();

        assert_eq!(report.result, RunResult::UserAborted);
        // Far sooner than the 30 s sampling interval.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn a_dead_worker_aborts_the_run() {
        let reader = ScriptedReader::new().script(0, steady(0, 60.0));
        let report = Monitor::new(
            devices(1),
            fast_config(),
            Box::new(reader),
            WorkerCommand::new("sh", vec!["-c".to_string(), "exit 3".to_string()]),
            CancelToken::new(),
        )
        .run();

        match report.result {
            RunResult::Error { ref reason } => {
                assert!(reason.contains("device 0"), "reason: {reason}");
                assert!(reason.contains("unexpectedly"), "reason: {reason}");
            }
            ref other => panic!("unexpected result: {other}"),
        }
    }

    #[test]
    fn a_spawn_failure_still_produces_a_report() {
        let reader = ScriptedReader::new().script(0, steady(0, 60.0));
        let report = Monitor::new(
            devices(1),
            fast_config(),
            Box::new(reader),
            WorkerCommand::new("/definitely/not/a/real/binary", Vec::new()),
            CancelToken::new(),
        )
        .run();

        match report.result {
            RunResult::Error { ref reason } => assert!(reason.contains("device 0")),
            ref other => panic!("unexpected result: {other}"),
        }
        assert!(report.snapshots.is_empty());
        assert!(report.device_peaks.is_empty());
        assert_eq!(report.version, crate::report::REPORT_VERSION);
    }

    #[cfg(unix)]
    #[test]
    fn a_sensor_blackout_past_the_threshold_aborts() {
        // No script at all: every read fails.
        let reader = ScriptedReader::new();
        let config = RunConfig { device_gone_ticks: 3, ..fast_config() };
        let report = Monitor::new(
            devices(1),
            config,
            Box::new(reader),
            sleeper(),
            CancelToken::new(),
        )
        .run();

        match report.result {
            RunResult::Error { ref reason } => {
                assert!(reason.contains("stopped responding"), "reason: {reason}");
            }
            ref other => panic!("unexpected result: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn transient_sensor_failures_below_the_threshold_are_absorbed() {
        let mut script: Vec<Result<TelemetrySample, SensorError>> = vec![
            Err(SensorError::Transient { device: 0, reason: "flaky".to_string() }),
            Err(SensorError::Transient { device: 0, reason: "flaky".to_string() }),
        ];
        script.push(Ok(TelemetrySample::mock(0, 60.0)));

        let reader = ScriptedReader::new().script(0, script);
        let config = RunConfig {
            duration: Some(Duration::from_millis(150)),
            device_gone_ticks: 5,
            ..fast_config()
        };
        let report = Monitor::new(
            devices(1),
            config,
            Box::new(reader),
            sleeper(),
            CancelToken::new(),
        )
        .run();

        assert_eq!(report.result, RunResult::Completed);
    }
}

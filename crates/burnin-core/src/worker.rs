//! Worker process supervision.
//!
//! One worker process per device, held in an arena owned by the supervisor.
//! Process isolation is the containment boundary: a workload that wedges the
//! driver or dies outright takes down its own process, never its siblings
//! and never the monitor.
//!
//! Cancellation crosses the process boundary as SIGTERM. Each worker
//! installs a handler that trips its process-local token; the supervisor
//! broadcasts the signal exactly once, on the first `signal_cancel`.
//! Shutdown always completes: cooperative join up to a deadline, then
//! SIGKILL for stragglers.

use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::device::DeviceInfo;
use crate::error::SupervisorError;

/// Grace for tearing down already-started siblings when a later spawn fails.
const PARTIAL_START_TEARDOWN: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Worker command template
// ---------------------------------------------------------------------------

/// Command template a worker process is launched from. `{index}` in the
/// program or any argument is substituted with the device index.
///
/// Workers run with stdin and stdout null and stderr inherited, so their
/// log lines interleave with the parent's.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn for_device(&self, index: u32) -> Command {
        let index = index.to_string();
        let mut cmd = Command::new(self.program.replace("{index}", &index));
        cmd.args(self.args.iter().map(|a| a.replace("{index}", &index)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        cmd
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// A worker that exited on its own, before cancellation was signalled.
#[derive(Debug, Clone, Copy)]
pub struct WorkerExit {
    pub device_index: u32,
    pub status: ExitStatus,
}

/// How a shutdown resolved: workers that exited on their own after the
/// cancellation broadcast vs. workers that had to be force-killed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub cooperative: usize,
    pub forced: usize,
}

struct WorkerHandle {
    device_index: u32,
    child: Child,
    exited: Option<ExitStatus>,
    reported: bool,
}

impl WorkerHandle {
    fn poll(&mut self) -> Option<ExitStatus> {
        if self.exited.is_none()
            && let Ok(Some(status)) = self.child.try_wait()
        {
            self.exited = Some(status);
        }
        self.exited
    }
}

/// Arena of one worker process per device.
pub struct WorkerSupervisor {
    workers: Vec<WorkerHandle>,
    token: CancelToken,
}

impl WorkerSupervisor {
    /// Spawn one worker per device. A spawn failure is fatal: siblings that
    /// already started are torn down before the error is returned, so a run
    /// never begins with partial device coverage.
    pub fn start(
        devices: &[DeviceInfo],
        command: &WorkerCommand,
        token: CancelToken,
    ) -> Result<Self, SupervisorError> {
        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(devices.len());
        for device in devices {
            match command.for_device(device.index).spawn() {
                Ok(child) => {
                    info!("worker for device {} up (pid {})", device.index, child.id());
                    workers.push(WorkerHandle {
                        device_index: device.index,
                        child,
                        exited: None,
                        reported: false,
                    });
                }
                Err(source) => {
                    let mut partial = Self { workers, token };
                    partial.signal_cancel();
                    partial.shutdown(PARTIAL_START_TEARDOWN);
                    return Err(SupervisorError::Spawn {
                        device: device.index,
                        source,
                    });
                }
            }
        }
        Ok(Self { workers, token })
    }

    /// The cancellation token shared with the workers.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Trip the cancellation token and, on the first call only, broadcast
    /// SIGTERM to every live worker. Idempotent.
    pub fn signal_cancel(&mut self) {
        if !self.token.cancel() {
            return;
        }
        debug!("broadcasting cancellation to {} worker(s)", self.workers.len());
        for worker in &mut self.workers {
            if worker.poll().is_none() {
                signal_term(&mut worker.child);
            }
        }
    }

    /// Join every worker, force-killing any that outlive the deadline.
    /// Always returns.
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownOutcome {
        self.signal_cancel();

        let deadline = Instant::now() + timeout;
        while self.workers.iter_mut().any(|w| w.poll().is_none()) {
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        let mut outcome = ShutdownOutcome::default();
        for worker in &mut self.workers {
            if worker.poll().is_some() {
                outcome.cooperative += 1;
                continue;
            }
            warn!(
                "worker for device {} ignored cancellation; force-killing",
                worker.device_index
            );
            let _ = worker.child.kill();
            if let Ok(status) = worker.child.wait() {
                worker.exited = Some(status);
            }
            outcome.forced += 1;
        }
        outcome
    }

    /// Workers that exited while cancellation was *not* signalled. Each exit
    /// is reported once. After cancellation, exits are expected and this
    /// always returns empty.
    pub fn reap_unexpected(&mut self) -> Vec<WorkerExit> {
        if self.token.is_cancelled() {
            return Vec::new();
        }
        let mut exits = Vec::new();
        for worker in &mut self.workers {
            if worker.reported {
                continue;
            }
            if let Some(status) = worker.poll() {
                worker.reported = true;
                exits.push(WorkerExit {
                    device_index: worker.device_index,
                    status,
                });
            }
        }
        exits
    }

    /// Workers still running.
    pub fn alive(&mut self) -> usize {
        self.workers.iter_mut().filter(|w| w.poll().is_none()).count()
    }
}

#[cfg(unix)]
fn signal_term(child: &mut Child) {
    // SAFETY: the pid comes from a live, un-reaped child handle we own.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn signal_term(child: &mut Child) {
    let _ = child.kill();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(n: u32) -> Vec<DeviceInfo> {
        (0..n)
            .map(|index| DeviceInfo {
                index,
                name: format!("GPU {index}"),
                mem_total_gb: 24.0,
            })
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_responsive_workers_shut_down_cooperatively() {
        let cmd = WorkerCommand::new("sleep", vec!["30".to_string()]);
        let mut sup =
            WorkerSupervisor::start(&devices(2), &cmd, CancelToken::new()).unwrap();
        assert_eq!(sup.alive(), 2);

        let outcome = sup.shutdown(Duration::from_secs(5));
        assert_eq!(outcome, ShutdownOutcome { cooperative: 2, forced: 0 });
        assert_eq!(sup.alive(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn term_ignoring_workers_are_force_killed_within_the_deadline() {
        let cmd = WorkerCommand::new(
            "sh",
            vec!["-c".to_string(), "trap '' TERM; sleep 60".to_string()],
        );
        let mut sup =
            WorkerSupervisor::start(&devices(1), &cmd, CancelToken::new()).unwrap();
        // Let the shell install its trap before we signal.
        std::thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        let outcome = sup.shutdown(Duration::from_millis(500));
        assert_eq!(outcome.forced, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.alive(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn self_exiting_workers_are_reaped_exactly_once() {
        let cmd = WorkerCommand::new("sh", vec!["-c".to_string(), "exit 7".to_string()]);
        let mut sup =
            WorkerSupervisor::start(&devices(1), &cmd, CancelToken::new()).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let exits = sup.reap_unexpected();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].device_index, 0);
        assert_eq!(exits[0].status.code(), Some(7));

        // Already reported; nothing new.
        assert!(sup.reap_unexpected().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn exits_after_cancellation_are_expected() {
        let cmd = WorkerCommand::new("sleep", vec!["30".to_string()]);
        let mut sup =
            WorkerSupervisor::start(&devices(1), &cmd, CancelToken::new()).unwrap();

        sup.signal_cancel();
        sup.signal_cancel(); // second call is a no-op

        std::thread::sleep(Duration::from_millis(300));
        assert!(sup.reap_unexpected().is_empty());
        sup.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn spawn_failure_is_fatal_and_names_the_device() {
        let cmd = WorkerCommand::new("/definitely/not/a/real/binary", Vec::new());
        let err = WorkerSupervisor::start(&devices(1), &cmd, CancelToken::new()).unwrap_err();
        match err {
            SupervisorError::Spawn { device, .. } => assert_eq!(device, 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn partial_bring_up_tears_down_started_siblings() {
        use std::os::unix::fs::PermissionsExt;

        // Only device 0's worker binary exists; device 1's spawn must fail
        // and take the first worker down with it.
        let dir = tempfile::tempdir().unwrap();
        let w0 = dir.path().join("w0");
        std::fs::write(&w0, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&w0, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cmd = WorkerCommand::new(
            dir.path().join("w{index}").display().to_string(),
            Vec::new(),
        );

        let start = Instant::now();
        let err = WorkerSupervisor::start(&devices(2), &cmd, CancelToken::new()).unwrap_err();
        match err {
            SupervisorError::Spawn { device, .. } => assert_eq!(device, 1),
            other => panic!("unexpected error: {other}"),
        }
        // Teardown of the live sibling is prompt (sleep dies to SIGTERM).
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn worker_command_substitutes_the_device_index() {
        let cmd = WorkerCommand::new(
            "burnin",
            vec!["worker".to_string(), "--device".to_string(), "{index}".to_string()],
        );
        let built = cmd.for_device(4);
        let args: Vec<_> = built.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["worker", "--device", "4"]);
    }
}

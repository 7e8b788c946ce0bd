//! Error taxonomy for the stress harness.
//!
//! Two small domain enums cover the failures the run loop must reason about.
//! Everything else (filesystem, subprocess plumbing) stays on plain
//! `std::io::Result` and is propagated with `?`.

use std::io;

use thiserror::Error;

/// Failure reading telemetry.
#[derive(Debug, Clone, Error)]
pub enum SensorError {
    /// One device, one tick: the sample is skipped and the run continues.
    #[error("telemetry read failed for device {device}: {reason}")]
    Transient { device: u32, reason: String },

    /// A tracked device has stopped responding entirely. Raised by the
    /// monitor after enough consecutive transient failures; escalates the
    /// run to an error abort.
    #[error("device {device} stopped responding to telemetry queries")]
    DeviceGone { device: u32 },
}

/// Failure bringing up workers. Fatal at start: a run that hits one of these
/// never enters its monitoring loop.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker for device {device}: {source}")]
    Spawn {
        device: u32,
        #[source]
        source: io::Error,
    },

    #[error("no workload command configured for mode '{mode}'")]
    NoWorkloadCommand { mode: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_errors_name_the_device() {
        let e = SensorError::Transient {
            device: 3,
            reason: "parse failure".to_string(),
        };
        assert!(e.to_string().contains("device 3"));
        assert!(e.to_string().contains("parse failure"));

        let gone = SensorError::DeviceGone { device: 1 };
        assert!(gone.to_string().contains("device 1"));
    }

    #[test]
    fn spawn_error_carries_io_source() {
        let e = SupervisorError::Spawn {
            device: 0,
            source: io::Error::new(io::ErrorKind::NotFound, "missing binary"),
        };
        let msg = e.to_string();
        assert!(msg.contains("device 0"));
        assert!(msg.contains("missing binary"));
    }

    #[test]
    fn missing_workload_names_the_mode() {
        let e = SupervisorError::NoWorkloadCommand {
            mode: "pcie".to_string(),
        };
        assert!(e.to_string().contains("'pcie'"));
    }
}

//! Hardware-free rehearsal of the full monitoring pipeline.
//!
//! Drives the monitor with scripted telemetry and placeholder workers:
//! device 0 ramps up and crosses the thermal limit, device 1 stays cool.
//! Prints the assembled report as JSON.
//!
//! Run: `cargo run --example dry_run`

use std::time::Duration;

use burnin_core::{
    CancelToken, DeviceInfo, Monitor, RunConfig, ScriptedReader, StressMode, TelemetrySample,
    WorkerCommand,
};

fn main() {
    let devices = vec![
        DeviceInfo {
            index: 0,
            name: "Mock GPU 0".to_string(),
            mem_total_gb: 24.0,
        },
        DeviceInfo {
            index: 1,
            name: "Mock GPU 1".to_string(),
            mem_total_gb: 24.0,
        },
    ];

    // Device 0 overheats on its eighth read.
    let mut ramp: Vec<_> = (0..7)
        .map(|i| Ok(TelemetrySample::mock(0, 70.0 + f64::from(i) * 3.0)))
        .collect();
    ramp.push(Ok(TelemetrySample::mock(0, 96.0)));
    let reader = ScriptedReader::new()
        .script(0, ramp)
        .script(1, vec![Ok(TelemetrySample::mock(1, 62.0))]);

    let config = RunConfig {
        mode: StressMode::Compute,
        duration: Some(Duration::from_secs(60)),
        sample_interval: Duration::from_millis(100),
        snapshot_interval: Duration::from_millis(300),
        ..RunConfig::default()
    };

    let worker = WorkerCommand::new("sleep", vec!["60".to_string()]);
    let report =
        Monitor::new(devices, config, Box::new(reader), worker, CancelToken::new()).run();

    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("report serializes")
    );
}

use std::path::PathBuf;

use burnin_core::{
    CancelToken, DEFAULT_SAMPLE_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SNAPSHOT_INTERVAL,
    Monitor, RunConfig, RunResult, SmiReader, StressMode, WorkerCommand, discover_devices,
    save_report, workload_command,
};

use super::{parse_duration, select_devices};

pub struct RunCommandConfig<'a> {
    pub devices: &'a str,
    pub mode: &'a str,
    pub duration: Option<&'a str>,
    pub temp_limit: f64,
    pub sample_interval: Option<&'a str>,
    pub snapshot_interval: Option<&'a str>,
    pub shutdown_timeout: Option<&'a str>,
    pub workload_cmd: Option<&'a str>,
    pub output: &'a str,
}

pub fn run(cfg: RunCommandConfig<'_>) {
    let mode: StressMode = match cfg.mode.parse() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    // Resolve the workload template up front: a mode with no command must
    // fail here, before any worker is spawned.
    let template = match workload_command(mode, cfg.workload_cmd) {
        Ok(template) => template,
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!("Provide one with --workload-cmd (\"{{index}}\" is replaced by the device index).");
            std::process::exit(1);
        }
    };

    let detected = match discover_devices() {
        Ok(devices) => devices,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };
    let devices = select_devices(detected, cfg.devices);

    let duration = cfg
        .duration
        .map(parse_duration)
        .filter(|d| !d.is_zero());

    let config = RunConfig {
        mode,
        duration,
        temp_limit_c: cfg.temp_limit,
        sample_interval: cfg
            .sample_interval
            .map(parse_duration)
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL),
        snapshot_interval: cfg
            .snapshot_interval
            .map(parse_duration)
            .unwrap_or(DEFAULT_SNAPSHOT_INTERVAL),
        shutdown_timeout: cfg
            .shutdown_timeout
            .map(parse_duration)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        ..RunConfig::default()
    };

    // Workers re-enter this binary through the hidden `worker` subcommand.
    let exe = match std::env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("Error: cannot locate own executable: {err}");
            std::process::exit(1);
        }
    };
    let worker = WorkerCommand::new(
        exe.display().to_string(),
        vec![
            "worker".to_string(),
            "--device".to_string(),
            "{index}".to_string(),
            "--mode".to_string(),
            mode.key().to_string(),
            "--workload-cmd".to_string(),
            template,
        ],
    );

    // Ctrl+C trips the interrupt token; the monitor honours it on its next
    // tick, after the safety check has seen fresh telemetry.
    let interrupt = CancelToken::new();
    let handler_token = interrupt.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        handler_token.cancel();
    }) {
        eprintln!("Error: cannot install interrupt handler: {err}");
        std::process::exit(1);
    }

    println!("burnin {}", burnin_core::VERSION);
    let device_list: Vec<String> = devices
        .iter()
        .map(|d| format!("{} ({})", d.index, d.name))
        .collect();
    println!("  Devices:   {}", device_list.join(", "));
    println!("  Mode:      {} ({})", mode, mode.label());
    match duration {
        Some(d) => println!("  Duration:  {}s", d.as_secs()),
        None => println!("  Duration:  until Ctrl+C"),
    }
    println!("  Limit:     {:.0}°C", config.temp_limit_c);
    println!();

    let report = Monitor::new(
        devices,
        config,
        Box::new(SmiReader::new()),
        worker,
        interrupt,
    )
    .run();

    let path = match save_report(&report, &PathBuf::from(cfg.output)) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("Error writing report: {err}");
            std::process::exit(1);
        }
    };

    println!();
    println!("Result:    {}", report.result);
    println!("Elapsed:   {:.1}s", report.total_elapsed_s);
    for (index, peak) in &report.device_peaks {
        let power = peak
            .max_power_w
            .map(|w| format!("{w:.1} W"))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "  GPU {index}: peak {:.0}°C, {}, {:.2} GB, avg util {:.1}%",
            peak.max_temp_c, power, peak.max_mem_used_gb, peak.avg_util_gpu
        );
    }
    println!("Report:    {}", path.display());

    if report.result != RunResult::Completed {
        std::process::exit(1);
    }
}

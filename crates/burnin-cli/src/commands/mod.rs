pub mod list;
pub mod run;
pub mod worker;

use std::time::Duration;

use burnin_core::DeviceInfo;

/// Parse a duration string like "300", "45s", "10m", "2h", "500ms".
pub fn parse_duration(s: &str) -> Duration {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        // Assume seconds
        (s, 1000)
    };

    let value: u64 = numeric.parse().unwrap_or_else(|_| {
        eprintln!("Invalid duration: {s}");
        std::process::exit(1);
    });

    Duration::from_millis(value * multiplier)
}

/// Resolve a device selection ("all" or comma-separated indices) against the
/// detected devices. Unknown indices are an error, not a silent skip: a
/// burn-in that quietly covers fewer devices than asked is worse than one
/// that refuses to start.
pub fn select_devices(detected: Vec<DeviceInfo>, filter: &str) -> Vec<DeviceInfo> {
    if filter.trim().eq_ignore_ascii_case("all") {
        if detected.is_empty() {
            eprintln!("Error: no devices detected");
            std::process::exit(1);
        }
        return detected;
    }

    let mut wanted: Vec<u32> = Vec::new();
    for part in filter.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<u32>() {
            Ok(index) => {
                if !wanted.contains(&index) {
                    wanted.push(index);
                }
            }
            Err(_) => {
                eprintln!("Error: invalid device index '{part}'");
                std::process::exit(1);
            }
        }
    }

    if wanted.is_empty() {
        eprintln!("Error: no devices selected");
        std::process::exit(1);
    }

    let mut selected = Vec::with_capacity(wanted.len());
    for index in wanted {
        match detected.iter().find(|d| d.index == index) {
            Some(device) => selected.push(device.clone()),
            None => {
                let known: Vec<String> =
                    detected.iter().map(|d| d.index.to_string()).collect();
                eprintln!(
                    "Error: device {index} not found (detected: {})",
                    known.join(", ")
                );
                std::process::exit(1);
            }
        }
    }
    selected
}

//! Enumerate GPUs and take one live telemetry sample from each.
//!
//! Needs nvidia-smi and at least one device.
//!
//! Run: `cargo run --example live_sample`

use burnin_core::{SensorReader, SmiReader, discover_devices, driver_version};

fn main() {
    let devices = match discover_devices() {
        Ok(devices) => devices,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    if let Some(version) = driver_version() {
        println!("Driver {version}");
    }

    let reader = SmiReader::new();
    for device in &devices {
        match reader.sample(device) {
            Ok(s) => println!(
                "[{}] {}: {:.0}°C, util {}%, {:.2}/{:.2} GB",
                s.index, s.name, s.temp_c, s.util_gpu_pct, s.mem_used_gb, s.mem_total_gb
            ),
            Err(err) => println!("[{}] {}: {err}", device.index, device.name),
        }
    }
}

use burnin_core::{discover_devices, driver_version};

pub fn run() {
    let devices = match discover_devices() {
        Ok(devices) => devices,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if let Some(version) = driver_version() {
        println!("Driver: {version}");
        println!();
    }

    println!("Found {} GPU(s):\n", devices.len());
    for device in &devices {
        println!(
            "  [{}] {:<36} {:>8.2} GB",
            device.index, device.name, device.mem_total_gb
        );
    }

    if devices.is_empty() {
        println!("  (none found)");
    }
}

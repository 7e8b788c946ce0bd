//! Hidden per-device worker entry point.
//!
//! Exit codes the supervisor relies on: 0 = cancelled cleanly, 1 = driver
//! or setup error, 2 = driver returned while the run was still live (a
//! stress-coverage fault).

use burnin_core::{CancelToken, CommandDriver, WorkloadDriver};

pub fn run(device: u32, mode: &str, workload_cmd: &str) {
    let token = CancelToken::new();
    let handler_token = token.clone();
    // ctrlc's termination feature routes SIGTERM, the supervisor's
    // cancellation broadcast, through the same handler as Ctrl+C.
    if let Err(err) = ctrlc::set_handler(move || {
        handler_token.cancel();
    }) {
        eprintln!("worker {device}: cannot install signal handler: {err}");
        std::process::exit(1);
    }

    let driver = match CommandDriver::from_template(workload_cmd) {
        Ok(driver) => driver,
        Err(err) => {
            eprintln!("worker {device}: {err}");
            std::process::exit(1);
        }
    };

    log::info!("worker {device} running mode {mode}");
    match driver.run(device, &token) {
        Ok(()) => {
            if token.is_cancelled() {
                log::info!("worker {device} cancelled; exiting");
                std::process::exit(0);
            }
            eprintln!("worker {device}: driver returned before cancellation");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("worker {device}: {err}");
            std::process::exit(1);
        }
    }
}

//! Early-boot logging: stderr plus `/dev/kmsg`, since PID 1 has no
//! reliable stdout sink until the workspace and the host connection are
//! up.

use std::io::Write;

pub fn log(msg: &str) {
    eprintln!("aegis-harness: {msg}");
    if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open("/dev/kmsg") {
        let _ = writeln!(f, "aegis-harness: {msg}");
    }
}

/// Logs `msg` and terminates the process. Used for the handful of boot
/// errors that are fatal: a misconfigured workspace mount must never
/// silently hide user data, and a missing host address leaves the harness
/// with nothing to dial.
pub fn fatal(msg: &str) -> ! {
    log(&format!("FATAL: {msg}"));
    std::process::exit(1);
}

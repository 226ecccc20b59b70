//! Signal delivery by PID for processes owned by another thread.
//!
//! The waiter only knows the current Kraken PID, not the `Child` handle the
//! execution thread holds, so termination goes through `kill(1)`.

use std::process::{Command, Stdio};

use tracing::debug;

/// Send SIGTERM (or SIGKILL when `force`). Returns whether `kill` succeeded.
pub fn send_signal_to_process(pid: u32, force: bool) -> bool {
    if pid == 0 {
        return false;
    }

    let signal = if force { "KILL" } else { "TERM" };

    match Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => {
            debug!(pid, signal, success = status.success(), "Sent signal");
            status.success()
        }
        Err(e) => {
            debug!(pid, signal, error = %e, "Failed to send signal");
            false
        }
    }
}

/// Whether `pid` still exists. Zombies count as alive until reaped.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    if cfg!(target_os = "linux") {
        return std::path::Path::new(&format!("/proc/{pid}")).exists();
    }

    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

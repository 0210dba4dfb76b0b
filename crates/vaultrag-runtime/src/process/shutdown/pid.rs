//! Kill processes by PID without reaping (no `Child` handle available).

use std::io;

#[cfg(unix)]
use std::time::Duration;
#[cfg(unix)]
use tokio::time::sleep;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

#[cfg(unix)]
use super::GRACE_PERIOD;

/// Kill a process by PID with SIGTERM → SIGKILL escalation.
///
/// # Strategy
/// 1. Send SIGTERM
/// 2. Poll for the grace period to verify process exit
/// 3. If still alive, send SIGKILL and poll again
///
/// # Differences from `shutdown_child`
/// - No `Child` handle, so the process **cannot be reaped** here
/// - Used for adopted backends and orphans from previous crashes
pub async fn kill_pid(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        kill_pid_unix(pid).await
    }

    #[cfg(not(unix))]
    {
        kill_pid_windows(pid).await
    }
}

#[cfg(unix)]
async fn kill_pid_unix(pid: u32) -> io::Result<()> {
    let nix_pid = Pid::from_raw(pid as i32);

    // Phase 1: SIGTERM
    if let Err(e) = signal::kill(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            // Already gone
            return Ok(());
        }
        return Err(io::Error::other(e));
    }

    if poll_for_exit(nix_pid).await {
        return Ok(());
    }

    // Phase 2: SIGKILL
    if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
        if e == Errno::ESRCH {
            return Ok(());
        }
        return Err(io::Error::other(e));
    }

    if poll_for_exit(nix_pid).await {
        return Ok(());
    }

    // Process did not exit even after SIGKILL (rare)
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("process {pid} did not exit after SIGKILL"),
    ))
}

/// Poll for process exit over the grace period using the null signal.
#[cfg(unix)]
async fn poll_for_exit(pid: Pid) -> bool {
    let attempts = GRACE_PERIOD.as_millis() / 100;
    for _ in 0..attempts {
        sleep(Duration::from_millis(100)).await;

        match signal::kill(pid, None) {
            Ok(()) => {
                // Still alive, keep polling
            }
            Err(Errno::ESRCH) => return true,
            Err(_) => {
                // Permission error - assume still alive
            }
        }
    }
    false
}

#[cfg(not(unix))]
async fn kill_pid_windows(_pid: u32) -> io::Result<()> {
    // Orphan cleanup by bare PID is primarily a macOS/Linux concern
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "PID-only kill not implemented on Windows",
    ))
}

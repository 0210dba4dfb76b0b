//! Kill whatever process is listening on a port.
//!
//! Used when tearing down an adopted backend: the supervisor never held a
//! `Child` handle for it, so the occupant has to be located by port first.

use std::io;

#[cfg(unix)]
use tokio::process::Command;
#[cfg(unix)]
use tracing::debug;

#[cfg(unix)]
use super::kill_pid;

/// Kill the process currently listening on `127.0.0.1:port`, if any.
///
/// Succeeds silently when nothing is listening. Uses SIGTERM → SIGKILL
/// escalation via [`kill_pid`] once the occupant has been located.
pub async fn kill_port_occupant(port: u16) -> io::Result<()> {
    #[cfg(unix)]
    {
        match pid_listening_on(port).await? {
            Some(pid) => {
                debug!(port = %port, pid = %pid, "Killing port occupant");
                kill_pid(pid).await
            }
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = port;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "port occupant lookup not implemented on Windows",
        ))
    }
}

/// Find the PID of the process listening on the given TCP port.
#[cfg(unix)]
async fn pid_listening_on(port: u16) -> io::Result<Option<u32>> {
    let output = Command::new("lsof")
        .arg("-ti")
        .arg(format!("tcp:{port}"))
        .arg("-sTCP:LISTEN")
        .output()
        .await?;

    // lsof exits non-zero when no process matches
    if !output.status.success() {
        return Ok(None);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().and_then(|line| line.trim().parse().ok()))
}

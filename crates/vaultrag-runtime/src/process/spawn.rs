//! Backend process spawning with log forwarding.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use vaultrag_core::BackendConfig;

/// Spawn the backend binary with the fixed, order-significant argument vector.
///
/// The child's working directory is the per-install storage directory, and
/// its standard streams are redirected into the supervisor's tracing sink
/// (stdout at info, stderr at warn). The caller owns the returned `Child`;
/// exit observation is the caller's responsibility.
pub fn spawn_backend(
    binary: &Path,
    config: &BackendConfig,
    working_dir: &Path,
) -> Result<Child> {
    let mut cmd = Command::new(binary);
    cmd.arg("--vault-path")
        .arg(&config.vault_path)
        .arg("--openai-key")
        .arg(&config.openai_key)
        .arg("--llm-model")
        .arg(&config.llm_model)
        .arg("--port")
        .arg(config.port.to_string());

    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn backend {}: {}", binary.display(), e))?;

    forward_output(&mut child, config.port);

    Ok(child)
}

fn forward_output(child: &mut Child, port: u16) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(text)) = lines.next_line().await {
                info!(port = %port, "backend: {text}");
            }
            debug!(port = %port, "stdout reader task exiting");
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(text)) = lines.next_line().await {
                warn!(port = %port, "backend: {text}");
            }
            debug!(port = %port, "stderr reader task exiting");
        });
    }
}

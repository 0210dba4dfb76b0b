//! Supervisor error taxonomy.

use thiserror::Error;

use vaultrag_core::{ConfigError, PathError};

use crate::health::ReconnectError;
use crate::provision::ProvisionError;

/// Errors surfaced by supervisor operations.
///
/// Background recovery (crash restarts, monitor-driven reconnects) reports
/// through the events port instead; these variants come from the explicitly
/// invoked operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No usable API credential; the backend would be spawned doomed.
    #[error("No OpenAI API key configured")]
    MissingCredential,

    /// Configuration rejected at construction time.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The target port is occupied by something that does not answer the
    /// health endpoint. The occupant is left alone; the user must free the
    /// port or pick another.
    #[error("Port {port} is in use by another process that is not a backend")]
    PortConflict { port: u16 },

    /// Binary download or verification failed.
    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    /// The backend process could not be spawned, or exited before it ever
    /// answered a health probe.
    #[error("Failed to start backend: {0}")]
    Spawn(String),

    /// The spawned backend never became healthy within the startup window.
    #[error("Backend on port {port} did not become healthy within {timeout_secs}s")]
    HealthTimeout { port: u16, timeout_secs: u64 },

    /// Reconnect was attempted directly and rejected.
    #[error("Reconnect failed: {0}")]
    Reconnect(#[from] ReconnectError),

    /// Install root could not be resolved or created.
    #[error(transparent)]
    Path(#[from] PathError),

    /// OS-level failure while tearing a process down.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Backend health status types for monitoring.

use serde::{Deserialize, Serialize};

/// Health status of the local backend as seen by the supervisor.
///
/// Used by the periodic monitor to classify probe outcomes and decide
/// between restart and reconnect paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BackendHealthStatus {
    /// Backend responded 200 on the health endpoint.
    Healthy,

    /// HTTP endpoint did not answer (refused, timed out, or non-200).
    Unreachable {
        /// Last error message from the probe attempt.
        #[serde(rename = "lastError")]
        last_error: String,
    },

    /// The owned backend process has exited.
    ProcessDied,
}

/// How the supervisor relates to the backend on its configured port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendOwnership {
    /// No backend is running under this supervisor.
    NoBackend,
    /// The supervisor spawned the process and holds its child handle.
    Owned,
    /// A healthy backend was already listening on the port; the supervisor
    /// monitors it but never held a child handle for it.
    Adopted,
}

impl BackendHealthStatus {
    /// Check if the status represents a healthy state.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if the status represents a failed state requiring recovery.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::ProcessDied | Self::Unreachable { .. })
    }
}

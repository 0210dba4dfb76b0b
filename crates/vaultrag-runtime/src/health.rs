//! HTTP health client for the local backend.
//!
//! Two calls are consumed by the supervisor: a liveness probe against
//! `GET /health` and a session-refresh request against `POST /reconnect`.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use vaultrag_core::BackendHealthStatus;

/// Per-request timeout for the liveness probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-request timeout for the reconnect call.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the reconnect endpoint.
///
/// Any variant signals the supervisor to fall back to a full restart;
/// `Rejected { status: 404 }` in particular means an older backend build
/// without the endpoint.
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("reconnect request failed: {0}")]
    Transport(String),

    #[error("backend rejected reconnect (status {status})")]
    Rejected { status: u16 },
}

/// HTTP client bound to one backend instance on localhost.
#[derive(Debug, Clone)]
pub struct HealthClient {
    base_url: String,
    client: Client,
}

impl HealthClient {
    /// Create a client for the backend on the given port.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            client: Client::new(),
        }
    }

    /// Single-shot liveness probe.
    ///
    /// Any network error or non-200 status yields `false`; this call never
    /// errors. Timeout is short - the monitor calls this on every tick.
    pub async fn check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {e}");
                false
            }
        }
    }

    /// Probe and classify the outcome for monitoring.
    pub async fn status(&self) -> BackendHealthStatus {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => BackendHealthStatus::Healthy,
            Ok(response) => BackendHealthStatus::Unreachable {
                last_error: format!("health endpoint returned status {}", response.status()),
            },
            Err(e) => BackendHealthStatus::Unreachable {
                last_error: e.to_string(),
            },
        }
    }

    /// Ask a reachable backend to refresh its internal session state.
    ///
    /// Used after host sleep or when an adopted backend looks unhealthy.
    /// Failure (including a missing endpoint on older builds) signals the
    /// caller to fall back to a full process restart.
    pub async fn reconnect(&self) -> Result<(), ReconnectError> {
        let url = format!("{}/reconnect", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(RECONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|e| ReconnectError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ReconnectError::Rejected {
                status: response.status().as_u16(),
            })
        }
    }
}

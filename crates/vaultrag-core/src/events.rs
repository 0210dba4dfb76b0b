//! Port for emitting backend lifecycle notices.
//!
//! The supervisor never renders UI. Everything a user should see - download
//! progress, crash notices, restart exhaustion - goes through this port, and
//! the host adapter (desktop extension, CLI, tests) decides how to show it.

/// Port for emitting backend lifecycle events.
///
/// # Design
///
/// - **Object-safe**: uses `&self` for dynamic dispatch via `Arc<dyn BackendEvents>`
/// - **Fire-and-forget**: methods don't return `Result` - adapters handle errors internally
/// - **Generic**: no knowledge of the host UI toolkit
pub trait BackendEvents: Send + Sync {
    /// Artifact download has started.
    fn provisioning_started(&self) {}

    /// Artifact download progress. `total` is `None` when the server did not
    /// report a content length (indeterminate progress).
    fn provisioning_progress(&self, received: u64, total: Option<u64>) {
        let _ = (received, total);
    }

    /// Backend confirmed healthy after a spawn we own.
    fn ready(&self, port: u16);

    /// An already-running healthy backend on the target port was adopted.
    fn adopted(&self, port: u16);

    /// The owned backend exited abnormally; an automatic restart is scheduled.
    fn crash_restarting(&self, attempt: u32, max: u32);

    /// Automatic restarts are exhausted; manual intervention required.
    fn restarts_exhausted(&self, attempts: u32);

    /// The backend never became healthy within the startup window.
    fn health_timeout(&self, port: u16);

    /// A reconnect attempt is in flight after a monitoring failure or wake.
    fn reconnecting(&self, port: u16);

    /// Reconnect succeeded; monitoring resumed without process disruption.
    fn reconnected(&self, port: u16);

    /// Recovery could not bring the backend back; a manual restart is
    /// required.
    fn recovery_failed(&self, port: u16);

    /// The backend was stopped deliberately.
    fn stopped(&self);
}

/// No-op implementation for contexts that don't surface notices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl BackendEvents for NoopEvents {
    fn ready(&self, _port: u16) {}
    fn adopted(&self, _port: u16) {}
    fn crash_restarting(&self, _attempt: u32, _max: u32) {}
    fn restarts_exhausted(&self, _attempts: u32) {}
    fn health_timeout(&self, _port: u16) {}
    fn reconnecting(&self, _port: u16) {}
    fn reconnected(&self, _port: u16) {}
    fn recovery_failed(&self, _port: u16) {}
    fn stopped(&self) {}
}

/// Implementation that forwards every notice to the tracing subscriber.
///
/// Useful for headless runs and as a default before the UI adapter registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

impl BackendEvents for TracingEvents {
    fn provisioning_started(&self) {
        tracing::info!("Downloading backend binary");
    }

    fn ready(&self, port: u16) {
        tracing::info!(port = %port, "Backend ready");
    }

    fn adopted(&self, port: u16) {
        tracing::info!(port = %port, "Adopted already-running backend");
    }

    fn crash_restarting(&self, attempt: u32, max: u32) {
        tracing::warn!(attempt = %attempt, max = %max, "Backend crashed, restarting");
    }

    fn restarts_exhausted(&self, attempts: u32) {
        tracing::error!(attempts = %attempts, "Backend restarts exhausted");
    }

    fn health_timeout(&self, port: u16) {
        tracing::warn!(port = %port, "Backend did not respond in time");
    }

    fn reconnecting(&self, port: u16) {
        tracing::info!(port = %port, "Reconnecting to backend");
    }

    fn reconnected(&self, port: u16) {
        tracing::info!(port = %port, "Backend reconnected");
    }

    fn recovery_failed(&self, port: u16) {
        tracing::error!(port = %port, "Backend recovery failed");
    }

    fn stopped(&self) {
        tracing::info!("Backend stopped");
    }
}

//! Backend lifecycle supervisor.
//!
//! One `Supervisor` owns one backend lifecycle on one port: provision the
//! binary, probe the port, adopt or spawn, confirm health, monitor, and
//! recover from crashes within a bounded restart budget. Public operations
//! are serialized through a single async mutex; background continuations
//! (crash restarts, monitor recovery) carry a generation stamp and become
//! no-ops when the state they were scheduled against has moved on.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vaultrag_core::{
    BackendConfig, BackendEvents, BackendHealthStatus, DirectoryCreationStrategy, ensure_directory,
};

use crate::health::HealthClient;
use crate::process::{kill_port_occupant, probe_port_settled, shutdown_child, spawn_backend};
use crate::provision::{self, ProgressCallback};

mod error;

pub use error::SupervisorError;
pub use vaultrag_core::BackendOwnership;

/// Maximum automatic restarts after abnormal exits before giving up.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Delay before respawning after an abnormal exit.
#[cfg(not(test))]
const RESTART_BACKOFF: Duration = Duration::from_secs(3);
#[cfg(test)]
const RESTART_BACKOFF: Duration = Duration::from_millis(200);

/// Period of the background health monitor.
const MONITOR_PERIOD: Duration = Duration::from_secs(30);

/// Poll interval while waiting for a fresh spawn to become healthy.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a fresh spawn gets to answer its first health probe.
#[cfg(not(test))]
const STARTUP_HEALTH_WINDOW: Duration = Duration::from_secs(60);
#[cfg(test)]
const STARTUP_HEALTH_WINDOW: Duration = Duration::from_secs(5);

/// A wake after a gap longer than this triggers a reconnect; shorter gaps
/// only refresh the liveness timestamp.
const WAKE_STALENESS: Duration = Duration::from_secs(60);

/// Supervisor for the local backend process.
///
/// Cheap to clone; clones share the same lifecycle state.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    config: BackendConfig,
    health: HealthClient,
    events: Arc<dyn BackendEvents>,
    inner: Mutex<Inner>,
}

/// Mutable lifecycle state, guarded by the operation mutex.
struct Inner {
    ownership: Ownership,
    /// Stamp for background continuations. Bumped on every transition that
    /// invalidates pending work; a continuation whose stamp no longer
    /// matches does nothing.
    generation: u64,
    restart_attempts: u32,
    /// True while a spawn is waiting for its first healthy probe. The exit
    /// watcher stands down during this window; the startup wait owns the
    /// outcome.
    awaiting_health: bool,
    /// Last moment the backend was observed healthy.
    last_seen: Instant,
    monitor: Option<MonitorLease>,
}

enum Ownership {
    None,
    Owned {
        pid: u32,
        stop: CancellationToken,
        watcher: JoinHandle<()>,
    },
    Adopted,
}

struct MonitorLease {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

const fn public_ownership(ownership: &Ownership) -> BackendOwnership {
    match ownership {
        Ownership::None => BackendOwnership::NoBackend,
        Ownership::Owned { .. } => BackendOwnership::Owned,
        Ownership::Adopted => BackendOwnership::Adopted,
    }
}

impl Supervisor {
    /// Create a supervisor for the given configuration.
    ///
    /// The configuration is validated here; the credential is checked at
    /// [`start`](Self::start) instead so a supervisor can exist before the
    /// user has entered a key.
    pub fn new(
        config: BackendConfig,
        events: Arc<dyn BackendEvents>,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;
        let health = HealthClient::new(config.port);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                health,
                events,
                inner: Mutex::new(Inner {
                    ownership: Ownership::None,
                    generation: 0,
                    restart_attempts: 0,
                    awaiting_health: false,
                    last_seen: Instant::now(),
                    monitor: None,
                }),
            }),
        })
    }

    /// The configuration this supervisor was built with.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    /// Current relationship to the backend on the configured port.
    pub async fn ownership(&self) -> BackendOwnership {
        let inner = self.shared.inner.lock().await;
        public_ownership(&inner.ownership)
    }

    /// Probe the backend and classify the result.
    ///
    /// Reports `ProcessDied` without touching the network when no backend is
    /// running under this supervisor.
    pub async fn health_status(&self) -> BackendHealthStatus {
        {
            let inner = self.shared.inner.lock().await;
            if matches!(inner.ownership, Ownership::None) {
                return BackendHealthStatus::ProcessDied;
            }
        }
        self.shared.health.status().await
    }

    /// Bring a backend up on the configured port.
    ///
    /// Provisions the binary if missing, then either adopts a healthy
    /// occupant of the port or spawns a fresh process and waits for it to
    /// become healthy. Idempotent: calling with a backend already running
    /// reports the existing ownership.
    ///
    /// An occupied port whose occupant does not answer the health endpoint
    /// is a [`SupervisorError::PortConflict`]; the occupant is never killed
    /// at start time.
    pub async fn start(&self) -> Result<BackendOwnership, SupervisorError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        if !matches!(inner.ownership, Ownership::None) {
            debug!("start() with backend already running");
            return Ok(public_ownership(&inner.ownership));
        }
        if !shared.config.has_credential() {
            return Err(SupervisorError::MissingCredential);
        }

        if !provision::is_backend_installed(&shared.config) {
            shared.events.provisioning_started();
            let events = Arc::clone(&shared.events);
            let progress: ProgressCallback =
                Box::new(move |received, total| events.provisioning_progress(received, total));
            provision::ensure_backend_installed(&shared.config, Some(&progress)).await?;
        }

        let port = shared.config.port;
        if probe_port_settled(port).await {
            if shared.health.check().await {
                inner.generation += 1;
                inner.ownership = Ownership::Adopted;
                inner.restart_attempts = 0;
                inner.last_seen = Instant::now();
                start_monitor(shared, &mut inner);
                shared.events.adopted(port);
                return Ok(BackendOwnership::Adopted);
            }
            return Err(SupervisorError::PortConflict { port });
        }

        inner.restart_attempts = 0;
        let (inner, result) = spawn_and_confirm(shared, inner).await;
        drop(inner);
        match result {
            Ok(()) => Ok(BackendOwnership::Owned),
            Err(e) => Err(map_startup_error(port, e)),
        }
    }

    /// Tear the backend down.
    ///
    /// Idempotent. An owned process is shut down gracefully through its
    /// watcher; an adopted one is located by port and killed. Cancels all
    /// pending background continuations.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        inner.generation += 1;
        inner.restart_attempts = 0;
        inner.awaiting_health = false;
        release_monitor(&mut inner);

        match std::mem::replace(&mut inner.ownership, Ownership::None) {
            Ownership::None => Ok(()),
            Ownership::Owned { pid, stop, watcher } => {
                debug!(pid = %pid, "Stopping owned backend");
                stop.cancel();
                let _ = watcher.await;
                shared.events.stopped();
                Ok(())
            }
            Ownership::Adopted => {
                let port = shared.config.port;
                if probe_port_settled(port).await {
                    kill_port_occupant(port).await?;
                }
                shared.events.stopped();
                Ok(())
            }
        }
    }

    /// Tell the supervisor the host machine just woke from sleep.
    ///
    /// A short gap only refreshes the liveness timestamp. After a long gap
    /// the backend's upstream connections are assumed stale, so the full
    /// reconnect-or-restart recovery runs.
    pub async fn notify_host_wake(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;
        if matches!(inner.ownership, Ownership::None) {
            return;
        }

        let gap = inner.last_seen.elapsed();
        if gap < WAKE_STALENESS {
            inner.last_seen = Instant::now();
            return;
        }

        info!(gap_secs = %gap.as_secs(), "Host woke after a long gap, verifying backend");
        release_monitor(&mut inner);
        let generation = inner.generation;
        drop(inner);

        recover(Arc::clone(shared), generation).await;
    }
}

/// Outcome of one spawn-and-confirm attempt, before mapping to the public
/// error type. The distinction drives restart policy: only `Crashed`
/// consumes restart budget.
enum StartupError {
    /// A newer transition (usually `stop()`) invalidated the attempt and
    /// owns the cleanup.
    Preempted,
    /// The process failed to spawn or exited before its first healthy probe.
    Crashed(String),
    /// The process stayed up but never answered within the startup window.
    /// Reported through the events port, never retried.
    TimedOut,
    /// Install-root resolution or directory creation failed.
    Setup(SupervisorError),
}

fn map_startup_error(port: u16, err: StartupError) -> SupervisorError {
    match err {
        StartupError::Preempted => {
            SupervisorError::Spawn("startup interrupted by stop".to_string())
        }
        StartupError::Crashed(reason) => SupervisorError::Spawn(reason),
        StartupError::TimedOut => SupervisorError::HealthTimeout {
            port,
            timeout_secs: STARTUP_HEALTH_WINDOW.as_secs(),
        },
        StartupError::Setup(e) => e,
    }
}

/// How the startup health wait resolved.
enum HealthWait {
    Ready,
    Exited,
    TimedOut,
    Cancelled,
}

/// Spawn the backend, wait for it to answer a health probe, and hand it to
/// the monitor.
///
/// Takes the operation guard but releases it for the duration of the health
/// wait, so `stop()` can pre-empt a spawn that is slow to come up. Returns a
/// guard reacquired after the wait resolved; the caller decides what a
/// failure means for the restart budget.
async fn spawn_and_confirm<'a>(
    shared: &'a Arc<Shared>,
    mut inner: MutexGuard<'a, Inner>,
) -> (MutexGuard<'a, Inner>, Result<(), StartupError>) {
    let config = &shared.config;
    let binary = match provision::installed_binary_path(config) {
        Ok(path) => path,
        Err(e) => return (inner, Err(StartupError::Setup(e.into()))),
    };
    let working_dir = match provision::install_root(config) {
        Ok(path) => path,
        Err(e) => return (inner, Err(StartupError::Setup(e.into()))),
    };
    if let Err(e) = ensure_directory(&working_dir, DirectoryCreationStrategy::AutoCreate) {
        return (inner, Err(StartupError::Setup(e.into())));
    }

    let mut child = match spawn_backend(&binary, config, &working_dir) {
        Ok(child) => child,
        Err(e) => return (inner, Err(StartupError::Crashed(e.to_string()))),
    };
    let Some(pid) = child.id() else {
        let _ = child.kill().await;
        return (
            inner,
            Err(StartupError::Crashed(
                "backend exited before supervision began".to_string(),
            )),
        );
    };
    info!(pid = %pid, port = %config.port, "Backend spawned");

    inner.generation += 1;
    let generation = inner.generation;
    let stop = CancellationToken::new();
    let exited = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn(watch_child(
        Arc::clone(shared),
        child,
        stop.clone(),
        generation,
        Arc::clone(&exited),
    ));
    inner.ownership = Ownership::Owned {
        pid,
        stop: stop.clone(),
        watcher,
    };
    inner.awaiting_health = true;
    drop(inner);

    // The lock is released for the whole wait; a concurrent stop() cancels
    // the token and this loop wakes immediately.
    let deadline = Instant::now() + STARTUP_HEALTH_WINDOW;
    let outcome = loop {
        if exited.load(Ordering::Acquire) {
            break HealthWait::Exited;
        }
        if shared.health.check().await {
            break HealthWait::Ready;
        }
        if Instant::now() >= deadline {
            break HealthWait::TimedOut;
        }
        tokio::select! {
            () = stop.cancelled() => break HealthWait::Cancelled,
            () = sleep(HEALTH_POLL_INTERVAL) => {}
        }
    };

    let mut inner = shared.inner.lock().await;
    if inner.generation != generation {
        // stop() or a newer transition won the race and owns the cleanup
        return (inner, Err(StartupError::Preempted));
    }
    inner.awaiting_health = false;

    match outcome {
        HealthWait::Ready => {
            inner.last_seen = Instant::now();
            inner.restart_attempts = 0;
            start_monitor(shared, &mut inner);
            shared.events.ready(config.port);
            (inner, Ok(()))
        }
        HealthWait::Exited => {
            inner.generation += 1;
            inner.ownership = Ownership::None;
            (
                inner,
                Err(StartupError::Crashed(
                    "backend exited before becoming healthy".to_string(),
                )),
            )
        }
        HealthWait::TimedOut => {
            teardown_owned(&mut inner).await;
            shared.events.health_timeout(config.port);
            (inner, Err(StartupError::TimedOut))
        }
        HealthWait::Cancelled => (inner, Err(StartupError::Preempted)),
    }
}

/// Gracefully tear down an owned process and invalidate its continuations.
async fn teardown_owned(inner: &mut Inner) {
    inner.generation += 1;
    release_monitor(inner);
    if let Ownership::Owned { stop, watcher, .. } =
        std::mem::replace(&mut inner.ownership, Ownership::None)
    {
        stop.cancel();
        let _ = watcher.await;
    }
}

/// Own the `Child` handle for one spawned backend.
///
/// Exit observation and deliberate shutdown race here; exactly one side
/// wins. Crash handling runs on a separate task so that awaiting this
/// watcher never deadlocks against the operation lock.
async fn watch_child(
    shared: Arc<Shared>,
    mut child: Child,
    stop: CancellationToken,
    generation: u64,
    exited: Arc<AtomicBool>,
) {
    tokio::select! {
        status = child.wait() => {
            exited.store(true, Ordering::Release);
            tokio::spawn(handle_exit(shared, status, generation));
            return;
        }
        () = stop.cancelled() => {}
    }

    match shutdown_child(child).await {
        Ok(status) => debug!(status = %status, "Backend shut down"),
        Err(e) => warn!(error = %e, "Backend shutdown failed"),
    }
}

/// React to a backend exit the supervisor did not ask for.
async fn handle_exit(shared: Arc<Shared>, status: io::Result<ExitStatus>, generation: u64) {
    let mut inner = shared.inner.lock().await;
    if inner.generation != generation {
        return;
    }
    if inner.awaiting_health {
        // The startup health wait observes this exit and reports it
        return;
    }
    release_monitor(&mut inner);
    inner.ownership = Ownership::None;
    inner.generation += 1;

    let abnormal = match &status {
        Ok(s) => !s.success(),
        Err(_) => true,
    };
    if !abnormal {
        info!("Backend exited cleanly, not restarting");
        return;
    }
    match &status {
        Ok(s) => warn!(status = %s, "Backend exited abnormally"),
        Err(e) => warn!(error = %e, "Backend exit status unavailable"),
    }

    if inner.restart_attempts >= MAX_RESTART_ATTEMPTS {
        shared.events.restarts_exhausted(inner.restart_attempts);
        return;
    }
    inner.restart_attempts += 1;
    shared.events.crash_restarting(inner.restart_attempts, MAX_RESTART_ATTEMPTS);
    let generation = inner.generation;
    drop(inner);
    schedule_restart(shared, generation);
}

/// Respawn after the back-off, unless the world moved on meanwhile.
///
/// Only a crash-style failure of the respawn consumes budget and schedules
/// another attempt. A respawn that comes up but never answers its health
/// probe is reported and the supervisor returns to idle; the budget is for
/// crash loops, not for a backend that runs without serving.
fn schedule_restart(shared: Arc<Shared>, generation: u64) {
    tokio::spawn(async move {
        sleep(RESTART_BACKOFF).await;

        let inner = shared.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let (mut inner, result) = spawn_and_confirm(&shared, inner).await;
        match result {
            Ok(()) | Err(StartupError::Preempted) => {}
            Err(StartupError::Crashed(reason)) => {
                warn!(error = %reason, "Restart attempt failed");
                if inner.restart_attempts >= MAX_RESTART_ATTEMPTS {
                    shared.events.restarts_exhausted(inner.restart_attempts);
                    return;
                }
                inner.restart_attempts += 1;
                shared
                    .events
                    .crash_restarting(inner.restart_attempts, MAX_RESTART_ATTEMPTS);
                inner.generation += 1;
                let generation = inner.generation;
                drop(inner);
                schedule_restart(shared, generation);
            }
            Err(StartupError::TimedOut) => {
                warn!("Restarted backend never became healthy, giving up");
            }
            Err(StartupError::Setup(e)) => {
                warn!(error = %e, "Restart attempt failed");
            }
        }
    });
}

fn start_monitor(shared: &Arc<Shared>, inner: &mut Inner) {
    release_monitor(inner);
    let cancel = CancellationToken::new();
    let generation = inner.generation;
    let handle = tokio::spawn(monitor_loop(Arc::clone(shared), cancel.clone(), generation));
    inner.monitor = Some(MonitorLease { cancel, handle });
}

fn release_monitor(inner: &mut Inner) {
    if let Some(lease) = inner.monitor.take() {
        lease.cancel.cancel();
        lease.handle.abort();
    }
}

/// Periodic health probe for a running backend.
///
/// On probe failure the loop hands its lease back and transitions into
/// recovery; it never continues ticking past a failure.
async fn monitor_loop(shared: Arc<Shared>, cancel: CancellationToken, generation: u64) {
    let mut ticker = interval(MONITOR_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The backend was confirmed healthy just before this loop started, so
    // swallow the interval's immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if shared.health.check().await {
            let mut inner = shared.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.last_seen = Instant::now();
            continue;
        }

        let adopted = {
            let mut inner = shared.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            // Hand the lease back directly so a concurrent release cannot
            // abort this task mid-recovery.
            inner.monitor = None;
            matches!(inner.ownership, Ownership::Adopted)
        };

        if adopted {
            debug!(port = %shared.config.port, "Adopted backend unhealthy, entering recovery");
            recover(shared, generation).await;
        } else {
            // An owned process that stops answering has died or is about
            // to; its exit watcher is the sole recovery driver.
            debug!(port = %shared.config.port, "Owned backend unhealthy, deferring to exit watcher");
        }
        return;
    }
}

/// Reconnect-or-restart recovery.
///
/// First ask the backend to refresh its own session state; only when that
/// fails is the process torn down and respawned with a fresh restart budget.
async fn recover(shared: Arc<Shared>, generation: u64) {
    let port = shared.config.port;
    shared.events.reconnecting(port);

    match shared.health.reconnect().await {
        Ok(()) => {
            let mut inner = shared.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.last_seen = Instant::now();
            start_monitor(&shared, &mut inner);
            shared.events.reconnected(port);
            return;
        }
        Err(e) => {
            warn!(port = %port, error = %e, "Reconnect failed, falling back to restart");
        }
    }

    let mut inner = shared.inner.lock().await;
    if inner.generation != generation {
        return;
    }
    inner.generation += 1;
    release_monitor(&mut inner);
    match std::mem::replace(&mut inner.ownership, Ownership::None) {
        Ownership::Owned { stop, watcher, .. } => {
            stop.cancel();
            let _ = watcher.await;
        }
        Ownership::Adopted => {
            if let Err(e) = kill_port_occupant(port).await {
                warn!(port = %port, error = %e, "Failed to clear adopted backend");
            }
        }
        Ownership::None => {}
    }
    inner.restart_attempts = 0;

    if probe_port_settled(port).await {
        warn!(port = %port, "Port still bound after teardown, cannot respawn");
        shared.events.recovery_failed(port);
        return;
    }
    let (inner, result) = spawn_and_confirm(&shared, inner).await;
    drop(inner);
    match result {
        Ok(()) | Err(StartupError::Preempted) => {}
        // A startup timeout already surfaced as a health_timeout notice
        Err(StartupError::TimedOut) => {}
        Err(StartupError::Crashed(reason)) => {
            warn!(port = %port, error = %reason, "Respawn failed during recovery");
            shared.events.recovery_failed(port);
        }
        Err(StartupError::Setup(e)) => {
            warn!(port = %port, error = %e, "Respawn failed during recovery");
            shared.events.recovery_failed(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use vaultrag_core::NoopEvents;

    #[derive(Default)]
    struct RecordingEvents {
        notices: StdMutex<Vec<String>>,
    }

    impl RecordingEvents {
        fn record(&self, notice: impl Into<String>) {
            self.notices.lock().unwrap().push(notice.into());
        }

        fn seen(&self) -> Vec<String> {
            self.notices.lock().unwrap().clone()
        }
    }

    impl BackendEvents for RecordingEvents {
        fn ready(&self, _port: u16) {
            self.record("ready");
        }
        fn adopted(&self, _port: u16) {
            self.record("adopted");
        }
        fn crash_restarting(&self, attempt: u32, _max: u32) {
            self.record(format!("crash_restarting:{attempt}"));
        }
        fn restarts_exhausted(&self, _attempts: u32) {
            self.record("restarts_exhausted");
        }
        fn health_timeout(&self, _port: u16) {
            self.record("health_timeout");
        }
        fn reconnecting(&self, _port: u16) {
            self.record("reconnecting");
        }
        fn reconnected(&self, _port: u16) {
            self.record("reconnected");
        }
        fn recovery_failed(&self, _port: u16) {
            self.record("recovery_failed");
        }
        fn stopped(&self) {
            self.record("stopped");
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    /// Config with a pre-"installed" binary so start() skips provisioning.
    fn installed_config(root: &std::path::Path, port: u16) -> BackendConfig {
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(vaultrag_core::backend_binary_name()), b"#!/bin/sh\n").unwrap();
        BackendConfig::new("/tmp/vault", "sk-test", "v0.4.2")
            .with_install_root(root)
            .with_port(port)
    }

    /// Config whose "installed binary" is a script that stays alive until
    /// signalled, standing in for a real backend process.
    #[cfg(unix)]
    fn sleeper_config(root: &std::path::Path, port: u16) -> BackendConfig {
        use std::os::unix::fs::PermissionsExt;
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(vaultrag_core::backend_binary_name());
        std::fs::write(&path, b"#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        BackendConfig::new("/tmp/vault", "sk-test", "v0.4.2")
            .with_install_root(root)
            .with_port(port)
    }

    /// Start answering 200 on a fixed port after a delay, simulating a
    /// spawned backend that takes a moment to bind its listener.
    fn health_server_on(port: u16, delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            sleep(delay).await;
            let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
                return;
            };
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        })
    }

    /// Answer every request with 200 until the returned task is aborted.
    async fn health_server() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (port, handle)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = BackendConfig::new("/tmp/vault", "sk-test", "v0.4.2").with_port(80);
        let result = Supervisor::new(config, Arc::new(NoopEvents));
        assert!(matches!(result, Err(SupervisorError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_requires_credential() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BackendConfig::new("/tmp/vault", "   ", "v0.4.2")
            .with_install_root(tmp.path())
            .with_port(free_port());
        let supervisor = Supervisor::new(config, Arc::new(NoopEvents)).unwrap();
        let result = supervisor.start().await;
        assert!(matches!(result, Err(SupervisorError::MissingCredential)));
    }

    #[tokio::test]
    async fn test_start_surfaces_provisioning_failure() {
        let tmp = tempfile::tempdir().unwrap();
        // Nothing installed and the release host does not exist
        let config = BackendConfig::new("/tmp/vault", "sk-test", "v0.4.2")
            .with_install_root(tmp.path())
            .with_port(free_port())
            .with_release_base_url(format!("http://127.0.0.1:{}/releases", free_port()));
        let supervisor = Supervisor::new(config, Arc::new(NoopEvents)).unwrap();
        let result = supervisor.start().await;
        assert!(matches!(result, Err(SupervisorError::Provisioning(_))));
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
    }

    #[tokio::test]
    async fn test_adopts_healthy_occupant() {
        let tmp = tempfile::tempdir().unwrap();
        let (port, server) = health_server().await;
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor = Supervisor::new(installed_config(tmp.path(), port), dyn_events).unwrap();

        let ownership = supervisor.start().await.unwrap();
        assert_eq!(ownership, BackendOwnership::Adopted);
        assert_eq!(supervisor.ownership().await, BackendOwnership::Adopted);
        assert!(events.seen().contains(&"adopted".to_string()));

        // Idempotent: a second start reports the existing adoption
        assert_eq!(supervisor.start().await.unwrap(), BackendOwnership::Adopted);

        server.abort();
    }

    #[tokio::test]
    async fn test_unhealthy_occupant_is_conflict_and_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        // Accepts connections but never answers HTTP
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let supervisor =
            Supervisor::new(installed_config(tmp.path(), port), Arc::new(NoopEvents)).unwrap();

        let result = supervisor.start().await;
        assert!(matches!(result, Err(SupervisorError::PortConflict { .. })));
        // The occupant must still be listening
        assert!(crate::process::is_port_in_use(port));
        drop(listener);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_never_started() {
        let tmp = tempfile::tempdir().unwrap();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor =
            Supervisor::new(installed_config(tmp.path(), free_port()), dyn_events).unwrap();

        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert!(events.seen().is_empty());
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
    }

    #[tokio::test]
    async fn test_wake_shortly_after_start_only_refreshes() {
        let tmp = tempfile::tempdir().unwrap();
        let (port, server) = health_server().await;
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor = Supervisor::new(installed_config(tmp.path(), port), dyn_events).unwrap();
        supervisor.start().await.unwrap();

        supervisor.notify_host_wake().await;
        assert!(!events.seen().contains(&"reconnecting".to_string()));

        server.abort();
    }

    #[cfg(unix)]
    async fn exit_status(code: u8) -> ExitStatus {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!("exit {code}"))
            .status()
            .await
            .unwrap()
    }

    /// Fabricate an owned process entry so exit handling can be driven
    /// without a real spawn. Returns the generation stamped on it.
    async fn fake_owned(shared: &Arc<Shared>) -> u64 {
        let mut inner = shared.inner.lock().await;
        inner.generation += 1;
        inner.ownership = Ownership::Owned {
            pid: 1,
            stop: CancellationToken::new(),
            watcher: tokio::spawn(async {}),
        };
        inner.generation
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_restart_budget_saturates_after_three_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor =
            Supervisor::new(installed_config(tmp.path(), free_port()), dyn_events).unwrap();
        let shared = &supervisor.shared;
        let crash = exit_status(1).await;

        for _ in 0..=MAX_RESTART_ATTEMPTS {
            let generation = fake_owned(shared).await;
            handle_exit(Arc::clone(shared), Ok(crash), generation).await;
            // Invalidate the scheduled back-off respawn before the next round
            shared.inner.lock().await.generation += 1;
        }

        assert_eq!(
            events.seen(),
            [
                "crash_restarting:1",
                "crash_restarting:2",
                "crash_restarting:3",
                "restarts_exhausted",
            ]
        );
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_spawned_backend_reaches_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor = Supervisor::new(sleeper_config(tmp.path(), port), dyn_events).unwrap();

        // The "backend" binds its port shortly after being spawned, safely
        // past the free-port probe at the front of start()
        let server = health_server_on(port, Duration::from_secs(1));

        let ownership = supervisor.start().await.unwrap();
        assert_eq!(ownership, BackendOwnership::Owned);
        assert_eq!(supervisor.ownership().await, BackendOwnership::Owned);
        assert!(events.seen().contains(&"ready".to_string()));

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
        assert!(events.seen().contains(&"stopped".to_string()));
        server.abort();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_stop_preempts_startup_health_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        // The spawned process never serves /health, so start() sits in its
        // startup wait until pre-empted
        let supervisor = Supervisor::new(sleeper_config(tmp.path(), port), dyn_events).unwrap();

        let starter = supervisor.clone();
        let start_task = tokio::spawn(async move { starter.start().await });
        // Let start() get past the port probe and into the health wait
        sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(2), supervisor.stop())
            .await
            .expect("stop() queued behind the startup health wait")
            .unwrap();

        let result = start_task.await.unwrap();
        assert!(result.is_err());
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
        assert!(events.seen().contains(&"stopped".to_string()));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_restart_health_timeout_does_not_consume_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let port = free_port();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        // The respawned process stays up but never answers /health
        let supervisor = Supervisor::new(sleeper_config(tmp.path(), port), dyn_events).unwrap();
        let shared = &supervisor.shared;

        let generation = fake_owned(shared).await;
        handle_exit(Arc::clone(shared), Ok(exit_status(1).await), generation).await;

        // Back-off elapses, the respawn runs, and its startup window lapses
        sleep(RESTART_BACKOFF + STARTUP_HEALTH_WINDOW + Duration::from_secs(2)).await;

        let seen = events.seen();
        let restarts = seen
            .iter()
            .filter(|n| n.starts_with("crash_restarting"))
            .count();
        assert_eq!(restarts, 1);
        assert!(seen.contains(&"health_timeout".to_string()));
        assert!(!seen.contains(&"restarts_exhausted".to_string()));
        // The timeout neither retried nor touched the budget
        assert_eq!(shared.inner.lock().await.restart_attempts, 1);
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_crashing_respawn_consumes_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        // The installed "binary" is not executable, so every respawn fails
        // the way a crash-looping backend does
        let supervisor =
            Supervisor::new(installed_config(tmp.path(), free_port()), dyn_events).unwrap();
        let shared = &supervisor.shared;

        let generation = fake_owned(shared).await;
        handle_exit(Arc::clone(shared), Ok(exit_status(1).await), generation).await;

        // Let the scheduled respawns run until the budget saturates
        sleep(RESTART_BACKOFF * 8).await;

        assert_eq!(
            events.seen(),
            [
                "crash_restarting:1",
                "crash_restarting:2",
                "crash_restarting:3",
                "restarts_exhausted",
            ]
        );
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_clean_exit_does_not_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor =
            Supervisor::new(installed_config(tmp.path(), free_port()), dyn_events).unwrap();
        let shared = &supervisor.shared;

        let generation = fake_owned(shared).await;
        handle_exit(Arc::clone(shared), Ok(exit_status(0).await), generation).await;

        assert!(events.seen().is_empty());
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
    }

    #[tokio::test]
    async fn test_stale_continuation_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor =
            Supervisor::new(installed_config(tmp.path(), free_port()), dyn_events).unwrap();
        let shared = &supervisor.shared;

        let generation = fake_owned(shared).await;
        supervisor.stop().await.unwrap();
        events.notices.lock().unwrap().clear();

        // The watcher's exit continuation arrives after the stop
        #[cfg(unix)]
        let status = exit_status(1).await;
        #[cfg(not(unix))]
        let status = {
            use std::os::windows::process::ExitStatusExt;
            ExitStatus::from_raw(1)
        };
        handle_exit(Arc::clone(shared), Ok(status), generation).await;

        assert!(events.seen().is_empty());
    }

    #[tokio::test]
    async fn test_adopted_recovery_reconnects_before_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let (port, server) = health_server().await;
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        let supervisor = Supervisor::new(installed_config(tmp.path(), port), dyn_events).unwrap();
        supervisor.start().await.unwrap();
        let shared = &supervisor.shared;

        // The fake backend answers POST /reconnect with 200, so recovery
        // must end there without touching the process
        let generation = shared.inner.lock().await.generation;
        recover(Arc::clone(shared), generation).await;

        let seen = events.seen();
        let reconnecting = seen.iter().position(|n| n == "reconnecting").unwrap();
        let reconnected = seen.iter().position(|n| n == "reconnected").unwrap();
        assert!(reconnecting < reconnected);
        assert_eq!(supervisor.ownership().await, BackendOwnership::Adopted);

        server.abort();
    }

    #[tokio::test]
    async fn test_failed_recovery_emits_notice() {
        let tmp = tempfile::tempdir().unwrap();
        let (port, server) = health_server().await;
        let events = Arc::new(RecordingEvents::default());
        let dyn_events: Arc<dyn BackendEvents> = events.clone();
        // The "installed binary" is not executable, so the recovery respawn
        // cannot succeed once the adopted backend is gone
        let supervisor = Supervisor::new(installed_config(tmp.path(), port), dyn_events).unwrap();
        supervisor.start().await.unwrap();
        let shared = &supervisor.shared;

        // The adopted backend disappears; reconnect has nothing to talk to
        server.abort();
        let _ = server.await;

        let generation = shared.inner.lock().await.generation;
        recover(Arc::clone(shared), generation).await;

        let seen = events.seen();
        assert!(seen.contains(&"reconnecting".to_string()));
        assert!(seen.contains(&"recovery_failed".to_string()));
        assert_eq!(supervisor.ownership().await, BackendOwnership::NoBackend);
    }

    #[tokio::test]
    async fn test_health_status_without_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor =
            Supervisor::new(installed_config(tmp.path(), free_port()), Arc::new(NoopEvents))
                .unwrap();
        assert_eq!(
            supervisor.health_status().await,
            BackendHealthStatus::ProcessDied
        );
    }
}

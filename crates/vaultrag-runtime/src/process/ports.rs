//! Port probing for the supervisor.

use std::net::TcpListener;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// How long to let the socket state settle before the first reading.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// How long to wait between the two readings of a double probe.
const REPROBE_DELAY: Duration = Duration::from_millis(250);

/// Check whether a TCP port on localhost is currently bound.
///
/// Attempts to bind a listener on `127.0.0.1:port`; binding success means the
/// port is free (the listener is dropped immediately), binding failure for
/// ANY reason is reported as in use. The conservative reading is deliberate:
/// a false "free" would cause a doomed spawn, while a false "in use" only
/// delays startup.
pub fn is_port_in_use(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener.local_addr().is_err(),
        Err(_) => true,
    }
}

/// Wait for the socket state to settle, then double-probe the port.
///
/// A reading taken immediately after a forceful stop is unreliable: the OS
/// may still hold the socket for a moment. The settle delay runs before the
/// first reading even when the port looks free, and a first reading of
/// "bound" is re-checked after a second delay.
pub async fn probe_port_settled(port: u16) -> bool {
    sleep(SETTLE_DELAY).await;
    if !is_port_in_use(port) {
        return false;
    }

    debug!(port = %port, "Port appears bound, re-probing after settle delay");
    sleep(REPROBE_DELAY).await;
    is_port_in_use(port)
}

//! Graceful backend shutdown.
//!
//! Three strategies, in decreasing order of knowledge about the target:
//! - `shutdown_child`: we own the `Child` handle (includes reaping)
//! - `kill_pid`: PID only, no handle (adopted or orphaned processes)
//! - `kill_port_occupant`: we only know the port the process is bound to

mod child;
mod occupant;
mod pid;

pub use child::shutdown_child;
pub use occupant::kill_port_occupant;
pub use pid::kill_pid;

use std::time::Duration;

/// Grace period between the termination request and the forceful kill.
pub(crate) const GRACE_PERIOD: Duration = Duration::from_secs(3);

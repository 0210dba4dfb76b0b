//! Backend process primitives: port probing, spawning, and shutdown.

pub mod ports;
pub mod shutdown;
pub mod spawn;

pub use ports::{is_port_in_use, probe_port_settled};
pub use shutdown::{kill_pid, kill_port_occupant, shutdown_child};
pub use spawn::spawn_backend;

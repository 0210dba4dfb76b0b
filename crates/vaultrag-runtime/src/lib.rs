//! Process runtime and OS-level concerns for the vaultrag backend supervisor.
//!
//! The centerpiece is [`supervisor::Supervisor`], which owns the full backend
//! lifecycle: provisioning the binary, probing the port, spawning the child,
//! confirming health, monitoring, and bounded-retry crash recovery.

pub mod health;
pub mod process;
pub mod provision;
pub mod supervisor;

pub use health::HealthClient;
pub use provision::{ProgressCallback, ProvisionError, ensure_backend_installed};
pub use supervisor::{BackendOwnership, Supervisor, SupervisorError};

//! Core domain types and port definitions for the vaultrag backend supervisor.
//!
//! This crate holds everything the runtime and the UI adapter share:
//! - `config` - immutable backend configuration snapshot
//! - `events` - port for surfacing user-facing lifecycle notices
//! - `paths` - install-root and binary path resolution
//! - `status` - backend health status types

pub mod config;
pub mod events;
pub mod paths;
pub mod status;

// Re-export commonly used types for convenience
pub use config::{
    BackendConfig, ConfigError, DEFAULT_BACKEND_PORT, DEFAULT_LLM_MODEL, DEFAULT_RELEASE_BASE_URL,
};
pub use events::{BackendEvents, NoopEvents, TracingEvents};
pub use paths::{
    DirectoryCreationStrategy, PathError, backend_binary_name, backend_binary_path, bin_dir,
    data_root, ensure_directory, verify_writable,
};
pub use status::{BackendHealthStatus, BackendOwnership};

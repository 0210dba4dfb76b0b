//! Path utilities for vaultrag data directories.
//!
//! This module provides the canonical path resolution for the supervisor:
//! - Install root (per-install storage directory, also the backend's
//!   working directory)
//! - Binary directory and platform-specific backend binary path
//!
//! # Design
//!
//! - Returns `PathBuf` and `PathError` for clear error handling
//! - No interactive/terminal I/O - adapters handle user prompts separately
//! - OS-specific logic is kept private in `platform`

mod ensure;
mod error;
mod platform;

pub use ensure::{DirectoryCreationStrategy, ensure_directory, verify_writable};
pub use error::PathError;
pub use platform::{backend_binary_name, backend_binary_path, bin_dir, data_root};

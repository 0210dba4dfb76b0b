//! Platform-specific path resolution.

use std::env;
use std::fs;
use std::path::PathBuf;

use super::error::PathError;

/// Get the root directory for supervisor data (binaries, backend working dir).
///
/// Resolution order:
/// 1. `VAULTRAG_DATA_DIR` environment variable (highest priority)
/// 2. System data directory (e.g. `~/.local/share/vaultrag`)
///
/// The directory is created if absent.
pub fn data_root() -> Result<PathBuf, PathError> {
    let root = match env::var("VAULTRAG_DATA_DIR") {
        Ok(path) => PathBuf::from(path),
        Err(_) => dirs::data_local_dir()
            .ok_or(PathError::NoDataDir)?
            .join("vaultrag"),
    };

    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| PathError::CreateFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;
    }

    Ok(root)
}

/// Get the directory holding managed backend binaries.
pub fn bin_dir() -> Result<PathBuf, PathError> {
    Ok(data_root()?.join("bin"))
}

/// Resolve the platform-specific backend binary name.
///
/// Release artifacts are published per-platform; the name is resolved once
/// from the host OS.
#[must_use]
pub const fn backend_binary_name() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "vaultrag-backend-macos"
    }

    #[cfg(target_os = "windows")]
    {
        "vaultrag-backend-windows.exe"
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        "vaultrag-backend-linux"
    }
}

/// Get the path to the managed backend binary.
pub fn backend_binary_path() -> Result<PathBuf, PathError> {
    Ok(bin_dir()?.join(backend_binary_name()))
}

//! Backend configuration snapshot.
//!
//! The supervisor receives a `BackendConfig` at construction time and never
//! mutates it afterwards. Settings changes in the host UI go through a full
//! stop/start cycle with a fresh snapshot.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Default port the backend listens on.
pub const DEFAULT_BACKEND_PORT: u16 = 8765;

/// Default OpenAI model used by the backend.
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Default base URL for release artifacts (binary + detached checksum).
pub const DEFAULT_RELEASE_BASE_URL: &str =
    "https://github.com/vaultrag/vaultrag-backend/releases/download";

/// Lowest port the backend may be configured to use.
///
/// Ports below this are privileged or reserved; the backend always binds an
/// unprivileged registered/dynamic port.
const MIN_PORT: u16 = 1025;

/// Errors from validating a backend configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configured port is in the privileged/reserved range.
    #[error("Port {port} is reserved. Choose a port between {MIN_PORT} and 65535.")]
    PortReserved { port: u16 },

    /// The vault path is empty.
    #[error("Vault path cannot be empty")]
    EmptyVaultPath,
}

/// Immutable configuration for one backend lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Absolute path to the vault (document corpus) root.
    pub vault_path: PathBuf,
    /// OpenAI API key passed to the backend. May be empty; `start()` fails
    /// fast on an empty credential rather than spawning a doomed process.
    pub openai_key: String,
    /// OpenAI model ID (e.g. `gpt-4o-mini`).
    pub llm_model: String,
    /// Port the backend listens on.
    pub port: u16,
    /// Release tag used to resolve the binary artifact (e.g. `v0.4.2`).
    pub release_tag: String,
    /// Base URL for release artifacts.
    pub release_base_url: String,
    /// Override for the install root. When `None`, the platform data
    /// directory is used (see `paths::data_root`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_root: Option<PathBuf>,
}

impl BackendConfig {
    /// Create a configuration with defaults for everything but the vault,
    /// credential and release tag.
    pub fn new(
        vault_path: impl Into<PathBuf>,
        openai_key: impl Into<String>,
        release_tag: impl Into<String>,
    ) -> Self {
        Self {
            vault_path: vault_path.into(),
            openai_key: openai_key.into(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            port: DEFAULT_BACKEND_PORT,
            release_tag: release_tag.into(),
            release_base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
            install_root: None,
        }
    }

    /// Set the port to listen on.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the LLM model ID.
    #[must_use]
    pub fn with_llm_model(mut self, model: impl Into<String>) -> Self {
        self.llm_model = model.into();
        self
    }

    /// Override the release base URL (tests, mirrors).
    #[must_use]
    pub fn with_release_base_url(mut self, url: impl Into<String>) -> Self {
        self.release_base_url = url.into();
        self
    }

    /// Override the install root (tests, portable installs).
    #[must_use]
    pub fn with_install_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.install_root = Some(root.into());
        self
    }

    /// Validate the configuration.
    ///
    /// Port must be in the registered/dynamic range; the vault path must be
    /// non-empty. The credential is deliberately NOT validated here - a
    /// missing key is a start-time failure, not a construction-time one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port < MIN_PORT {
            return Err(ConfigError::PortReserved { port: self.port });
        }
        if self.vault_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyVaultPath);
        }
        Ok(())
    }

    /// Check whether a usable credential is present.
    pub fn has_credential(&self) -> bool {
        !self.openai_key.trim().is_empty()
    }
}

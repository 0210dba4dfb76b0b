//! Backend binary provisioning.
//!
//! Downloads the platform-specific backend binary and its detached checksum
//! from the configured release base, verifies integrity, and installs the
//! binary with the right permissions. Provisioning is all-or-nothing: the
//! binary path is only returned once the artifact on disk is verified, and a
//! checksum mismatch deletes the download so a retry can never silently
//! reuse an unverified file.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::{Client, redirect::Policy};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use vaultrag_core::{
    BackendConfig, DirectoryCreationStrategy, PathError, backend_binary_name, data_root,
    ensure_directory,
};

/// Thread-safe download progress callback.
///
/// Called with `(bytes_received, content_length)`; the total is `None` when
/// the server did not report a content length.
pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Bound on redirect hops when following release asset redirects.
const MAX_REDIRECT_HOPS: usize = 10;

/// Connect timeout for all provisioning requests.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Total timeout for the (small) checksum fetch.
const CHECKSUM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors that can occur while provisioning the backend binary.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Fetching the detached checksum file failed with an HTTP status.
    #[error("Failed to fetch checksum from {url}: HTTP {status}")]
    ChecksumFetch { url: String, status: u16 },

    /// The checksum file contained no usable digest token.
    #[error("Checksum file at {url} is empty or malformed")]
    ChecksumMalformed { url: String },

    /// The binary download failed with an HTTP status.
    #[error("Download from {url} failed: HTTP {status}")]
    DownloadFailed { url: String, status: u16 },

    /// The downloaded bytes do not match the expected digest.
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Network-level failure (connect, redirect loop, stream error).
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    /// Install directory could not be resolved or created.
    #[error("Path error: {0}")]
    Path(#[from] PathError),

    /// Filesystem failure while writing the artifact.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ephemeral state for one provisioning attempt. Never persisted.
struct DownloadSession {
    binary_url: String,
    checksum_url: String,
    dest: PathBuf,
}

impl DownloadSession {
    fn new(config: &BackendConfig, dest: PathBuf) -> Self {
        let base = config.release_base_url.trim_end_matches('/');
        let tag = &config.release_tag;
        let binary = backend_binary_name();
        Self {
            binary_url: format!("{base}/{tag}/{binary}"),
            checksum_url: format!("{base}/{tag}/{binary}.sha256"),
            dest,
        }
    }
}

/// Resolve the install root for this configuration.
///
/// The install root is both where binaries live (under `bin/`) and the
/// working directory the backend is spawned with.
pub fn install_root(config: &BackendConfig) -> Result<PathBuf, PathError> {
    match &config.install_root {
        Some(root) => Ok(root.clone()),
        None => data_root(),
    }
}

/// Path where the backend binary is (or will be) installed.
pub fn installed_binary_path(config: &BackendConfig) -> Result<PathBuf, PathError> {
    Ok(install_root(config)?.join("bin").join(backend_binary_name()))
}

/// Check if the backend binary is already installed.
pub fn is_backend_installed(config: &BackendConfig) -> bool {
    installed_binary_path(config).is_ok_and(|p| p.exists())
}

/// Ensure a verified backend binary is installed, downloading if missing.
///
/// An artifact already on disk is trusted for the remainder of the process
/// lifetime; verification happens at download time. Returns the binary path.
pub async fn ensure_backend_installed(
    config: &BackendConfig,
    progress: Option<&ProgressCallback>,
) -> Result<PathBuf, ProvisionError> {
    let dest = installed_binary_path(config)?;
    if dest.exists() {
        debug!(path = %dest.display(), "Backend binary already installed");
        return Ok(dest);
    }

    if let Some(parent) = dest.parent() {
        ensure_directory(parent, DirectoryCreationStrategy::AutoCreate)?;
    }

    let session = DownloadSession::new(config, dest.clone());
    let client = Client::builder()
        .redirect(Policy::limited(MAX_REDIRECT_HOPS))
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;

    let expected = fetch_expected_digest(&client, &session.checksum_url).await?;
    info!(url = %session.binary_url, "Downloading backend binary");
    download_and_verify(&client, &session, &expected, progress).await?;

    make_executable(&dest).await?;
    strip_quarantine(&dest).await;

    info!(path = %dest.display(), "Backend binary installed");
    Ok(dest)
}

/// Fetch the detached checksum file and extract the expected hex digest.
async fn fetch_expected_digest(client: &Client, url: &str) -> Result<String, ProvisionError> {
    let response = client
        .get(url)
        .timeout(CHECKSUM_TIMEOUT)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ProvisionError::ChecksumFetch {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let body = response.text().await?;
    parse_digest(&body).ok_or_else(|| ProvisionError::ChecksumMalformed {
        url: url.to_string(),
    })
}

/// Parse the first whitespace-delimited token of a checksum file as the
/// digest (the `sha256sum` format is `<digest>  <filename>`).
fn parse_digest(body: &str) -> Option<String> {
    body.split_whitespace()
        .next()
        .filter(|token| token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_lowercase)
}

/// Stream-download the binary, hashing as bytes arrive, and verify against
/// the expected digest. On mismatch the file is deleted - a retry must
/// re-download rather than reuse unverified bytes.
async fn download_and_verify(
    client: &Client,
    session: &DownloadSession,
    expected: &str,
    progress: Option<&ProgressCallback>,
) -> Result<(), ProvisionError> {
    let response = client.get(&session.binary_url).send().await?;

    if !response.status().is_success() {
        return Err(ProvisionError::DownloadFailed {
            url: session.binary_url.clone(),
            status: response.status().as_u16(),
        });
    }

    let total = response.content_length();
    let mut file = fs::File::create(&session.dest).await?;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Stream died mid-download; nothing on disk is trustworthy
                let _ = fs::remove_file(&session.dest).await;
                return Err(ProvisionError::Http(e));
            }
        };
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        received += chunk.len() as u64;

        if let Some(cb) = progress {
            cb(received, total);
        }
    }

    file.flush().await?;
    drop(file);

    let actual = format!("{:x}", hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        warn!(path = %session.dest.display(), "Checksum mismatch, deleting download");
        let _ = fs::remove_file(&session.dest).await;
        return Err(ProvisionError::IntegrityMismatch {
            path: session.dest.clone(),
            expected: expected.to_string(),
            actual,
        });
    }

    Ok(())
}

/// Set owner/group/other execute bits on the installed binary.
#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Best-effort removal of the macOS downloaded-file quarantine attribute.
///
/// The attribute may simply not exist; failure to strip it is non-fatal.
#[cfg(target_os = "macos")]
async fn strip_quarantine(path: &Path) {
    let result = tokio::process::Command::new("xattr")
        .arg("-d")
        .arg("com.apple.quarantine")
        .arg(path)
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {
            debug!(path = %path.display(), "Stripped quarantine attribute");
        }
        Ok(_) => {
            debug!(path = %path.display(), "No quarantine attribute to strip");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to run xattr");
        }
    }
}

#[cfg(not(target_os = "macos"))]
async fn strip_quarantine(_path: &Path) {}

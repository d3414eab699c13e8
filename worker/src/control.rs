//! Self-update and rebuild handling for control commands.
//!
//! `update_worker` downloads a release artifact plus its checksum
//! manifest, verifies the digest, then execs the replacement binary after
//! the commanded delay. `rebuild_worker` rebuilds from the local checkout.
//! Failures leave the current process running and are surfaced through
//! the heartbeat's `last_update_error` field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("artifact download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("artifact digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("checksum manifest malformed")]
    BadManifest,
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("rebuild failed: {0}")]
    Rebuild(String),
}

pub struct Updater {
    client: reqwest::Client,
    staging_dir: PathBuf,
}

impl Updater {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            staging_dir: staging_dir.into(),
        }
    }

    /// Fetch, verify and stage a release binary. Returns the staged path;
    /// the caller scheds the exec.
    pub async fn stage_release(
        &self,
        repo: &str,
        version: &str,
    ) -> Result<PathBuf, UpdateError> {
        let artifact_url = format!(
            "https://github.com/{repo}/releases/download/{version}/guardant-worker"
        );
        let manifest_url = format!("{artifact_url}.sha256");

        let manifest = self
            .client
            .get(&manifest_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let expected = manifest
            .split_whitespace()
            .next()
            .ok_or(UpdateError::BadManifest)?
            .to_ascii_lowercase();

        let artifact = self
            .client
            .get(&artifact_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        verify_sha256(&artifact, &expected)?;

        std::fs::create_dir_all(&self.staging_dir)?;
        let staged = self.staging_dir.join(format!("guardant-worker-{version}"));
        std::fs::write(&staged, &artifact)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))?;
        }
        info!(version, path = %staged.display(), "release staged");
        Ok(staged)
    }

    /// Rebuild the worker from the checkout at `repo_dir`.
    pub async fn rebuild(&self, repo_dir: &Path) -> Result<PathBuf, UpdateError> {
        let status = Command::new("cargo")
            .args(["build", "--release", "--bin", "guardant-worker"])
            .current_dir(repo_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(UpdateError::Rebuild(format!("cargo exited with {status}")));
        }
        Ok(repo_dir.join("target/release/guardant-worker"))
    }
}

pub(crate) fn verify_sha256(bytes: &[u8], expected_hex: &str) -> Result<(), UpdateError> {
    let actual = format!("{:x}", Sha256::digest(bytes));
    if actual == expected_hex {
        Ok(())
    } else {
        Err(UpdateError::DigestMismatch {
            expected: expected_hex.to_string(),
            actual,
        })
    }
}

/// Replace this process with the staged binary after `delay`, preserving
/// argv and environment. Never returns on success.
pub async fn exec_after_delay(binary: PathBuf, delay: Duration) -> std::io::Error {
    info!(binary = %binary.display(), delay_ms = delay.as_millis() as u64, "restart scheduled");
    tokio::time::sleep(delay).await;
    let args: Vec<String> = std::env::args().skip(1).collect();
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&binary).args(&args).exec();
        warn!(error = %err, "exec failed");
        err
    }
    #[cfg(not(unix))]
    {
        match std::process::Command::new(&binary).args(&args).spawn() {
            Ok(_) => std::process::exit(0),
            Err(err) => {
                warn!(error = %err, "spawn failed");
                err
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_verification() {
        let body = b"artifact bytes";
        let good = format!("{:x}", Sha256::digest(body));
        assert!(verify_sha256(body, &good).is_ok());
        assert!(matches!(
            verify_sha256(body, "deadbeef"),
            Err(UpdateError::DigestMismatch { .. })
        ));
    }
}

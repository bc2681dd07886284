//! Atomic file persistence, cross-run stores and HTTP transport for jobhound.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

mod http;
mod state;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use state::{load_preferences, save_preferences, SeenStore, StatePaths, StatusError, StatusTracker};

pub const CRATE_NAME: &str = "jobhound-storage";

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers never see a partial file.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// [`write_bytes_atomic`] retried under `policy`; the last error is returned once the budget is spent.
pub async fn write_bytes_with_retry(
    path: &Path,
    bytes: &[u8],
    policy: BackoffPolicy,
) -> anyhow::Result<()> {
    let mut attempt = 0usize;
    loop {
        match write_bytes_atomic(path, bytes).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 < policy.attempts() => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(path = %path.display(), attempt, error = %err, "store write failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "writing {} failed after {} attempts",
                        path.display(),
                        policy.attempts()
                    )
                })
            }
        }
    }
}

pub fn write_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        base_delay: std::time::Duration::from_millis(50),
        max_delay: std::time::Duration::from_millis(500),
    }
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_bytes_with_retry(path, &bytes, write_policy()).await
}

/// Load a JSON document, treating a missing or unreadable file as `T::default()`.
pub async fn load_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "store file absent; starting empty");
            return T::default();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "store file unreadable; starting empty");
            return T::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "store file corrupt; starting empty");
            T::default()
        }
    }
}

pub async fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("creating directory {}", path.display()))?;
    Ok(path.to_path_buf())
}

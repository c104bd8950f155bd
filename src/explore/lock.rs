// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Advisory file locking for shared JSON documents.
//!
//! Each document path maps to a sentinel file in the lock directory. The
//! sentinel is locked with an exclusive `flock`-style lock, so separate
//! processes (and separate handles within one process) exclude each other.
//! The lock is released when the [`LockGuard`] drops.
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! target, so a reader never sees a half-written document.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::error::ExploreError;
use crate::telemetry::Metrics;

/// Default time to wait for a lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    sentinel: PathBuf,
    owner: String,
}

impl LockGuard {
    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.sentinel.display(), e);
        }
    }
}

/// Locked read, write and read-modify-write of JSON documents.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    lock_dir: PathBuf,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl FileLockManager {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sentinel file used to lock `target`.
    ///
    /// Targets under the lock directory's parent are keyed by their path
    /// relative to it, so the same document maps to the same sentinel
    /// however the volume is mounted (host path or `/shared` in a sandbox).
    pub fn sentinel_path(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(48)
            .collect();

        let key = self
            .lock_dir
            .parent()
            .and_then(|root| target.strip_prefix(root).ok())
            .unwrap_or(target);
        let digest = Sha256::digest(key.to_string_lossy().as_bytes());
        let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        self.lock_dir.join(format!("{sanitized}-{hash}.lock"))
    }

    /// Acquire the lock for `target`, polling until the configured timeout.
    pub async fn acquire(&self, target: &Path, owner: &str) -> Result<LockGuard, ExploreError> {
        tokio::fs::create_dir_all(&self.lock_dir).await?;
        let sentinel = self.sentinel_path(target);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&sentinel)?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= self.timeout {
                        return Err(ExploreError::LockTimeout {
                            path: target.to_path_buf(),
                            owner: owner.to_string(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(ExploreError::Io(e)),
            }
        }

        let waited = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_operation("lock.wait", waited);
        }
        debug!(owner, waited_ms = waited.as_millis() as u64, "Acquired lock on {}", target.display());

        let mut guard = LockGuard {
            file,
            sentinel,
            owner: owner.to_string(),
        };
        record_owner(&mut guard)?;
        Ok(guard)
    }

    /// Read a document under its lock. A missing file reads as `None`.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(path = %path.display())))]
    pub async fn read_with_lock<T>(&self, path: &Path, owner: &str) -> Result<Option<T>, ExploreError>
    where
        T: DeserializeOwned,
    {
        let _guard = self.acquire(path, owner).await?;
        read_json(path).await
    }

    /// Replace a document under its lock.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, document), fields(path = %path.display())))]
    pub async fn write_with_lock<T>(&self, path: &Path, document: &T, owner: &str) -> Result<(), ExploreError>
    where
        T: Serialize + Sync,
    {
        let _guard = self.acquire(path, owner).await?;
        write_json_atomic(path, document).await
    }

    /// Read, transform and write a document while holding its lock.
    ///
    /// A missing document starts from `T::default()`. If the file's
    /// modification time changes between the read and the write, the update
    /// is abandoned with [`ExploreError::ConcurrentModification`].
    #[cfg_attr(feature = "telemetry", instrument(skip(self, mutate), fields(path = %path.display())))]
    pub async fn update_with_lock<T, F>(&self, path: &Path, owner: &str, mutate: F) -> Result<T, ExploreError>
    where
        T: DeserializeOwned + Serialize + Default + Sync,
        F: FnOnce(T) -> T + Send,
    {
        let _guard = self.acquire(path, owner).await?;

        let before = modified_time(path).await?;
        let current = read_json(path).await?.unwrap_or_default();
        let updated = mutate(current);

        if modified_time(path).await? != before {
            return Err(ExploreError::ConcurrentModification(path.to_path_buf()));
        }
        write_json_atomic(path, &updated).await?;
        Ok(updated)
    }
}

/// Record the owner label and acquisition time in a held sentinel.
fn record_owner(guard: &mut LockGuard) -> Result<(), ExploreError> {
    guard.file.set_len(0)?;
    let stamp = chrono::Utc::now().to_rfc3339();
    writeln!(guard.file, "{}\n{}", guard.owner, stamp)?;
    guard.file.flush()?;
    Ok(())
}

async fn modified_time(path: &Path) -> Result<Option<SystemTime>, ExploreError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read and parse a JSON document. Missing and empty files read as `None`.
pub(crate) async fn read_json<T>(path: &Path) -> Result<Option<T>, ExploreError>
where
    T: DeserializeOwned,
{
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&content)?))
}

/// Write a JSON document through a temporary sibling file and rename.
pub(crate) async fn write_json_atomic<T>(path: &Path, document: &T) -> Result<(), ExploreError>
where
    T: Serialize + ?Sized,
{
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let temp = parent.join(format!(".{}.{}.tmp", file_name, &suffix[..8]));

    let content = serde_json::to_vec_pretty(document)?;
    if let Err(e) = tokio::fs::write(&temp, &content).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

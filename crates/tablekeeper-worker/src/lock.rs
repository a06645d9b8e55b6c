//! File-based mutual exclusion between worker instances
//!
//! The lock file holds a single JSON [`LockRecord`]. A record is valid until
//! its `expires_at`; a crashed holder's lock is reclaimed once it expires.
//!
//! Every read-check-write runs under an exclusive advisory lock on a sidecar
//! `<path>.guard` file, so two processes that both see the same expired
//! record cannot both reclaim it. This is a local primitive: instances on different hosts only exclude
//! each other if the lock path is on shared storage.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Environment, LockConfig};
use crate::error::LockError;
use crate::wait::sleep_or_cancel;

/// The lock file's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub environment: Environment,
}

impl LockRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Acquires and releases the lock file at one path
#[derive(Debug)]
pub struct LockManager {
    path: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
    attempts: u32,
    environment: Environment,
    /// Serializes acquire/release within this process
    local: Mutex<()>,
}

impl LockManager {
    pub fn new(config: &LockConfig, environment: Environment) -> Self {
        Self {
            path: config.path.clone(),
            timeout: config.timeout,
            retry_interval: config.retry_interval,
            attempts: config.attempts.max(1),
            environment,
            local: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar file whose advisory lock serializes access across processes
    pub fn guard_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".guard");
        PathBuf::from(name)
    }

    /// Block until this process holds the sidecar lock. Released on drop.
    fn exclusive(&self) -> Result<File> {
        let path = self.guard_path();
        let dir = self.dir();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory {}", dir.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock guard {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(file)
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    }

    /// Read the current record, if any. A corrupt file reads as `None`.
    pub fn current(&self) -> Result<Option<LockRecord>> {
        Ok(self.read()?.flatten())
    }

    /// `None` when there is no file, `Some(None)` when it is unreadable
    fn read(&self) -> Result<Option<Option<LockRecord>>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read lock file {}", self.path.display()));
            }
        };

        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(Some(record))),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable lock file");
                Ok(Some(None))
            }
        }
    }

    /// Take the lock for `owner_id`.
    ///
    /// Succeeds if there is no lock file, the existing record has expired,
    /// or the existing record already belongs to `owner_id` (returned as-is).
    /// Otherwise fails with [`LockError::Held`].
    pub fn acquire_lock(&self, owner_id: &str) -> Result<LockRecord> {
        let _local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let _exclusive = self.exclusive()?;
        let now = Utc::now();

        let file = self.read()?;
        let present = file.is_some();
        let existing = file.flatten();
        if let Some(record) = &existing {
            if !record.is_expired_at(now) {
                if record.owner_id == owner_id {
                    debug!(owner = %owner_id, lock_id = %record.id, "Lock already held by caller");
                    return Ok(record.clone());
                }
                warn!(
                    owner = %record.owner_id,
                    expires_at = %record.expires_at,
                    "Lock held elsewhere"
                );
                return Err(LockError::Held {
                    owner: record.owner_id.clone(),
                    expires_at: record.expires_at,
                }
                .into());
            }
            info!(
                previous_owner = %record.owner_id,
                expired_at = %record.expires_at,
                "Reclaiming expired lock"
            );
        }

        let record = LockRecord {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(self.timeout)?,
            environment: self.environment,
        };

        let tmp = self.write_temp(&record)?;
        if present {
            tmp.persist(&self.path).map_err(|e| e.error).with_context(|| {
                format!("Failed to replace lock file {}", self.path.display())
            })?;
        } else if let Err(e) = tmp.persist_noclobber(&self.path) {
            if e.error.kind() == ErrorKind::AlreadyExists {
                return Err(self.contended());
            }
            return Err(e.error)
                .with_context(|| format!("Failed to create lock file {}", self.path.display()));
        }

        info!(
            owner = %owner_id,
            lock_id = %record.id,
            expires_at = %record.expires_at,
            "Lock acquired"
        );
        Ok(record)
    }

    /// Release `record`. Returns whether the file was removed.
    ///
    /// Does nothing if the file is gone or now holds a different record.
    pub fn release_lock(&self, record: &LockRecord) -> Result<bool> {
        let _local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let _exclusive = self.exclusive()?;

        match self.current()? {
            Some(current) if current.id == record.id => {}
            Some(current) => {
                debug!(
                    lock_id = %record.id,
                    current_owner = %current.owner_id,
                    "Lock was re-acquired by another owner, not releasing"
                );
                return Ok(false);
            }
            None => return Ok(false),
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(owner = %record.owner_id, lock_id = %record.id, "Lock released");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove lock file {}", self.path.display())),
        }
    }

    /// Try `acquire_lock` up to the configured number of attempts, sleeping
    /// the retry interval between them. I/O errors are not retried.
    pub async fn acquire_with_retry(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<LockRecord> {
        let mut attempt = 1;
        loop {
            match self.acquire_lock(owner_id) {
                Ok(record) => return Ok(record),
                Err(e) if e.downcast_ref::<LockError>().is_some() && attempt < self.attempts => {
                    debug!(
                        owner = %owner_id,
                        attempt,
                        delay_ms = self.retry_interval.as_millis(),
                        error = %e,
                        "Lock unavailable, retrying"
                    );
                    sleep_or_cancel(self.retry_interval, cancel).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_temp(&self, record: &LockRecord) -> Result<NamedTempFile> {
        let dir = self.dir();
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    fn contended(&self) -> anyhow::Error {
        LockError::Contended {
            path: self.path.display().to_string(),
        }
        .into()
    }
}

/// Releases the lock when dropped.
///
/// Holding a guard across the provisioning call guarantees release on every
/// exit path, panics included.
pub struct LockGuard {
    manager: Arc<LockManager>,
    record: Option<LockRecord>,
}

impl LockGuard {
    pub fn new(manager: Arc<LockManager>, record: LockRecord) -> Self {
        Self {
            manager,
            record: Some(record),
        }
    }

    pub fn record(&self) -> Option<&LockRecord> {
        self.record.as_ref()
    }

    /// Release now, surfacing any error
    pub fn release(mut self) -> Result<bool> {
        match self.record.take() {
            Some(record) => self.manager.release_lock(&record),
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            if let Err(e) = self.manager.release_lock(&record) {
                warn!(lock_id = %record.id, error = ?e, "Failed to release lock");
            }
        }
    }
}

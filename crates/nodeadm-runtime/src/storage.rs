use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use nodeadm_core::error::ConvergenceError;
use nodeadm_core::node::NodeContext;
use nodeadm_core::time::{archive_stamp, parse_archive_stamp};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage I/O failed at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl StorageError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for ConvergenceError {
    fn from(err: StorageError) -> Self {
        ConvergenceError::StorageFault(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// What an archive call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Live storage was moved to this archive directory.
    Archived(PathBuf),
    /// The node had no live storage; nothing was moved.
    NothingToArchive,
}

/// Host-local storage lifecycle for node containers.
#[async_trait]
pub trait StorageMaintainer: Send + Sync {
    /// Move the node's live storage into the archive. Calling this again
    /// after a successful archive returns [`ArchiveOutcome::NothingToArchive`].
    async fn archive_node_storage(&self, context: &NodeContext) -> StorageResult<ArchiveOutcome>;

    /// Delete archives past retention. Returns how many were removed.
    async fn cleanup_after_archive(&self) -> StorageResult<usize>;

    /// Bytes used by the node's live storage (0 if it has none).
    async fn disk_usage(&self, context: &NodeContext) -> StorageResult<u64>;
}

/// Filesystem layout:
///
/// ```text
/// <root>/live/<container>/...
/// <root>/archive/<container>_<YYYYmmddHHMMSS>/...
/// ```
pub struct FsStorageMaintainer {
    root: PathBuf,
    retention: Duration,
}

impl FsStorageMaintainer {
    pub fn new(root: PathBuf, retention: Duration) -> Self {
        Self { root, retention }
    }

    pub fn live_dir(&self, context: &NodeContext) -> PathBuf {
        self.root.join("live").join(context.container_name.as_str())
    }

    pub fn archive_root(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// First free archive path for `name`, starting at `at`.
    async fn archive_target(&self, name: &str, mut at: DateTime<Utc>) -> PathBuf {
        loop {
            let candidate = self
                .archive_root()
                .join(format!("{}_{}", name, archive_stamp(at)));
            if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return candidate;
            }
            at += chrono::Duration::seconds(1);
        }
    }

    /// Remove archives whose stamp is before `cutoff`.
    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let archive_root = self.archive_root();
        let mut entries = match tokio::fs::read_dir(&archive_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::io(&archive_root, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&archive_root, e))?
        {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(stamp) = file_name
                .rsplit_once('_')
                .and_then(|(_, stamp)| parse_archive_stamp(stamp))
            else {
                debug!(entry = %file_name, "Skipping unrecognised archive entry");
                continue;
            };
            if stamp >= cutoff {
                continue;
            }
            let path = entry.path();
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(archive = %path.display(), "Removed expired archive");
                    removed += 1;
                }
                Err(e) => {
                    warn!(archive = %path.display(), error = %e, "Failed to remove expired archive");
                }
            }
        }
        Ok(removed)
    }
}

async fn is_empty_or_missing(dir: &Path) -> StorageResult<bool> {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(dir, e))?
            .is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(StorageError::io(dir, e)),
    }
}

#[async_trait]
impl StorageMaintainer for FsStorageMaintainer {
    async fn archive_node_storage(&self, context: &NodeContext) -> StorageResult<ArchiveOutcome> {
        let live = self.live_dir(context);
        if is_empty_or_missing(&live).await? {
            debug!(container = %context.container_name, "No live storage to archive");
            return Ok(ArchiveOutcome::NothingToArchive);
        }

        let archive_root = self.archive_root();
        tokio::fs::create_dir_all(&archive_root)
            .await
            .map_err(|e| StorageError::io(&archive_root, e))?;

        let target = self
            .archive_target(context.container_name.as_str(), Utc::now())
            .await;
        tokio::fs::rename(&live, &target)
            .await
            .map_err(|e| StorageError::io(&live, e))?;
        tokio::fs::create_dir_all(&live)
            .await
            .map_err(|e| StorageError::io(&live, e))?;

        info!(
            hostname = %context.hostname,
            archive = %target.display(),
            "Archived node storage"
        );
        Ok(ArchiveOutcome::Archived(target))
    }

    async fn cleanup_after_archive(&self) -> StorageResult<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        self.cleanup_before(Utc::now() - retention).await
    }

    async fn disk_usage(&self, context: &NodeContext) -> StorageResult<u64> {
        let mut total = 0;
        let mut pending = vec![self.live_dir(context)];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(&dir, e))?
            {
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| StorageError::io(&entry.path(), e))?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += metadata.len();
                }
            }
        }
        Ok(total)
    }
}

//! Feed persistence: atomic writes, backups, advisory locking, HTTP fetch.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use feedsync_core::{Document, ParseError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod http;
pub mod lock;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
pub use lock::{LockError, LockHandle};

pub const CRATE_NAME: &str = "feedsync-storage";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing feed {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug, Clone)]
pub struct PersistedFeed {
    pub path: PathBuf,
    pub byte_size: usize,
    pub job_count: usize,
}

/// Read and parse the feed. A missing file is `Ok(None)`: first run.
pub async fn load_document(path: &Path) -> Result<Option<Document>, LoadError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    feedsync_core::parse(&bytes)
        .map(Some)
        .map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize and atomically replace the feed at `path`.
pub async fn persist_document(document: &Document, path: &Path) -> anyhow::Result<PersistedFeed> {
    let bytes = feedsync_core::serialize(document);
    write_atomic(path, &bytes).await?;
    tracing::info!(path = %path.display(), jobs = document.len(), bytes = bytes.len(), "feed persisted");
    Ok(PersistedFeed {
        path: path.to_path_buf(),
        byte_size: bytes.len(),
        job_count: document.len(),
    })
}

/// Write `bytes` to a unique temp sibling, fsync, then rename over `path`.
/// Readers see either the old file or the new one, never a partial write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating feed directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "feed".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp feed file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp feed file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp feed file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp feed file {}", temp_path.display()))?;
        drop(file);
        fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "atomically renaming temp feed {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

/// Copy the current feed into `backup_dir` under a timestamped name.
/// Returns `None` when there is no feed to back up.
pub async fn backup_document(
    path: &Path,
    backup_dir: &Path,
    at: DateTime<Utc>,
) -> anyhow::Result<Option<PathBuf>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading feed for backup {}", path.display()))
        }
    };
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "feed".to_string());
    let target = backup_dir.join(format!("{stem}.{}.xml", at.format("%Y%m%d_%H%M%S")));
    write_atomic(&target, &bytes).await?;
    tracing::info!(backup = %target.display(), "feed backed up");
    Ok(Some(target))
}

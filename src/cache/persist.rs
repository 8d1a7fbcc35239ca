//! Durable mirror for value cache entries.
//!
//! The in-memory map stays authoritative; a store only lets entries survive a
//! restart. Every store error is logged by the caller and otherwise ignored.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::entry::CacheEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode entry `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store has been closed")]
    Closed,
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<(String, CacheEntry)>, StoreError>;
    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    async fn close(&self);
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    #[serde(flatten)]
    entry: CacheEntry,
}

/// One JSON file per entry, named by the SHA-256 of the cache key.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    closed: AtomicBool,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(&dir, err))?;
        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.dir
            .join(format!("{}.json", hex::encode(hasher.finalize())))
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn load_all(&self) -> Result<Vec<(String, CacheEntry)>, StoreError> {
        self.ensure_open()?;
        let mut reader = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|err| StoreError::io(&self.dir, err))?;

        let mut loaded = Vec::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|err| StoreError::io(&self.dir, err))?
        {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(
                        target = "vitae::cache::persist",
                        op = "load_all",
                        path = %path.display(),
                        error = %err,
                        "Skipping unreadable cache file"
                    );
                    continue;
                }
            };
            match serde_json::from_slice::<StoredRecord>(&bytes) {
                Ok(record) => loaded.push((record.key, record.entry)),
                Err(err) => warn!(
                    target = "vitae::cache::persist",
                    op = "load_all",
                    path = %path.display(),
                    error = %err,
                    "Skipping corrupt cache file"
                ),
            }
        }
        Ok(loaded)
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        let record = StoredRecord {
            key: key.to_string(),
            entry: entry.clone(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        // Staging name is unique per write; concurrent puts of one key meet only at the rename.
        let path = self.path_for(key);
        let staging = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        if let Err(err) = tokio::fs::write(&staging, bytes).await {
            discard_staging(&staging).await;
            return Err(StoreError::io(&staging, err));
        }
        if let Err(err) = tokio::fs::rename(&staging, &path).await {
            discard_staging(&staging).await;
            return Err(StoreError::io(&path, err));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut reader = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|err| StoreError::io(&self.dir, err))?;
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|err| StoreError::io(&self.dir, err))?
        {
            let path = item.path();
            let name = path.to_string_lossy();
            if !(name.ends_with(".json") || name.ends_with(".tmp")) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io(&path, err)),
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn discard_staging(staging: &Path) {
    if let Err(err) = tokio::fs::remove_file(staging).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(
            target = "vitae::cache::persist",
            op = "put",
            path = %staging.display(),
            error = %err,
            "Failed to remove staging file"
        );
    }
}

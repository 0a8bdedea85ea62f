use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::cache::{default_entry_ttl, Cache, CacheKey};
use crate::error::{Error, Result};

/// Expiry metadata stored alongside each cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    expires_at: DateTime<Utc>,
}

/// File-per-entry cache under a base directory.
///
/// Values land in `<base>/<key>` with a `.meta` sibling carrying the
/// expiry. Writes go to a temp file first and are renamed into place so a
/// concurrent reader never observes a torn entry.
pub struct DiskCache {
    base_dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        Self::with_ttl(base_dir, default_entry_ttl())
    }

    pub fn with_ttl(base_dir: PathBuf, ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| Error::Cache(format!("creating cache dir {:?}: {}", base_dir, e)))?;
        Ok(Self { base_dir, ttl })
    }

    fn value_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.base_dir.clone();
        for segment in key.segments() {
            path.push(segment);
        }
        path
    }

    // Appends rather than replaces an extension: tags like `v1.2.3` must
    // not collide after truncation.
    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.value_path(key).into_os_string();
        path.push(".meta");
        PathBuf::from(path)
    }

    async fn read_meta(&self, key: &CacheKey) -> Result<EntryMeta> {
        let bytes = fs::read(self.meta_path(key))
            .await
            .map_err(|_| Error::NotCached)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Cache(format!("decoding metadata for {}: {}", key, e)))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Cache(format!("creating entry dir {:?}: {}", parent, e)))?;
        }
        let temp = {
            let mut temp = path.as_os_str().to_os_string();
            temp.push(".tmp");
            PathBuf::from(temp)
        };
        fs::write(&temp, data)
            .await
            .map_err(|e| Error::Cache(format!("writing entry {:?}: {}", temp, e)))?;
        fs::rename(&temp, path)
            .await
            .map_err(|e| Error::Cache(format!("renaming entry into {:?}: {}", path, e)))?;
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) {
        let _ = fs::remove_file(self.value_path(key)).await;
        let _ = fs::remove_file(self.meta_path(key)).await;
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn get(&self, key: &CacheKey) -> Result<Vec<u8>> {
        let meta = self.read_meta(key).await?;
        if meta.expires_at <= Utc::now() {
            self.evict(key).await;
            return Err(Error::NotCached);
        }
        fs::read(self.value_path(key))
            .await
            .map_err(|_| Error::NotCached)
    }

    async fn get_expiration(&self, key: &CacheKey) -> Result<DateTime<Utc>> {
        let meta = self.read_meta(key).await?;
        if meta.expires_at <= Utc::now() {
            self.evict(key).await;
            return Err(Error::NotCached);
        }
        Ok(meta.expires_at)
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>) -> Result<()> {
        let value_path = self.value_path(key);
        Self::write_atomic(&value_path, &value).await?;

        let meta = EntryMeta {
            expires_at: Utc::now() + self.ttl,
        };
        let meta_bytes = serde_json::to_vec(&meta)?;
        Self::write_atomic(&self.meta_path(key), &meta_bytes).await?;

        tracing::debug!(key = %key, bytes = value.len(), "cache entry written");
        Ok(())
    }
}

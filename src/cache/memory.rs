use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::cache::{default_entry_ttl, Cache, CacheKey};
use crate::error::{Error, Result};

struct MemoryEntry {
    expires_at: DateTime<Utc>,
    value: Vec<u8>,
}

/// In-process cache for tests and single-node deployments.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_ttl(default_entry_ttl())
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Vec<u8>> {
        let id = key.to_string();
        let entries = self.entries.read().await;
        match entries.get(&id) {
            Some(entry) if entry.expires_at > Utc::now() => Ok(entry.value.clone()),
            _ => Err(Error::NotCached),
        }
    }

    async fn get_expiration(&self, key: &CacheKey) -> Result<DateTime<Utc>> {
        let id = key.to_string();
        let entries = self.entries.read().await;
        match entries.get(&id) {
            Some(entry) if entry.expires_at > Utc::now() => Ok(entry.expires_at),
            _ => Err(Error::NotCached),
        }
    }

    async fn set(&self, key: &CacheKey, value: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                expires_at: Utc::now() + self.ttl,
                value,
            },
        );
        Ok(())
    }
}

//! Expiring key/value store for registry data.
//!
//! Two key families: tag lists, scoped to a repository, and per-tag image
//! manifests, scoped to a fully-qualified reference. Both are keyed by the
//! registry username so differently-authenticated views never collide.
//! Writes are blind overwrites; readers signal a miss with
//! [`Error::NotCached`].

mod disk;
mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::image::ImageRef;

/// How long a cache entry lives after being written.
pub fn default_entry_ttl() -> Duration {
    Duration::hours(1)
}

/// Key of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The list of tags for one repository, as seen by one user.
    Tags {
        username: String,
        repository: String,
    },
    /// The manifest of one fully-qualified image reference.
    Manifest { username: String, image: ImageRef },
}

impl CacheKey {
    pub fn tags(username: &str, image: &ImageRef) -> Self {
        CacheKey::Tags {
            username: username.to_string(),
            repository: image.repository_id(),
        }
    }

    pub fn manifest(username: &str, image: &ImageRef) -> Self {
        CacheKey::Manifest {
            username: username.to_string(),
            image: image.clone(),
        }
    }

    /// Path-style rendering used by the stores. The username segment falls
    /// back to `anonymous` so unauthenticated entries have a stable home.
    pub fn segments(&self) -> Vec<String> {
        fn user_segment(username: &str) -> String {
            if username.is_empty() {
                "anonymous".to_string()
            } else {
                sanitize(username)
            }
        }

        match self {
            CacheKey::Tags {
                username,
                repository,
            } => vec![
                "tags".to_string(),
                user_segment(username),
                sanitize(repository),
            ],
            CacheKey::Manifest { username, image } => vec![
                "manifests".to_string(),
                user_segment(username),
                sanitize(&image.repository_id()),
                sanitize(&image.tag),
            ],
        }
    }
}

fn sanitize(segment: &str) -> String {
    segment.replace(['/', ':'], "_")
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments().join("/"))
    }
}

/// An expiring key/value store. Key-level writes are atomic; no cross-key
/// transactions are offered or needed.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch the value for a key, or [`Error::NotCached`].
    async fn get(&self, key: &CacheKey) -> Result<Vec<u8>>;

    /// When the entry for a key expires, or [`Error::NotCached`].
    async fn get_expiration(&self, key: &CacheKey) -> Result<DateTime<Utc>>;

    /// Store a value; overwrites blindly and restarts the entry's TTL.
    async fn set(&self, key: &CacheKey, value: Vec<u8>) -> Result<()>;
}

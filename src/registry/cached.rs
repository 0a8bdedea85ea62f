use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{Cache, CacheKey};
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::registry::{Credentials, ImageInfo, Registry};

/// Read-side registry view answered entirely from the warmed cache, so
/// release planning does not touch the network.
pub struct CachedRegistry {
    cache: Arc<dyn Cache>,
    host_credentials: HashMap<String, Credentials>,
}

impl CachedRegistry {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            host_credentials: HashMap::new(),
        }
    }

    pub fn with_credentials(
        cache: Arc<dyn Cache>,
        host_credentials: HashMap<String, Credentials>,
    ) -> Self {
        Self {
            cache,
            host_credentials,
        }
    }

    fn username_for(&self, host: &str) -> &str {
        self.host_credentials
            .get(host)
            .map(|c| c.username.as_str())
            .unwrap_or("")
    }
}

#[async_trait]
impl Registry for CachedRegistry {
    async fn repository_images(&self, repository: &ImageRef) -> Result<Vec<ImageInfo>> {
        let username = self.username_for(&repository.host);
        let tags_key = CacheKey::tags(username, repository);
        let raw = match self.cache.get(&tags_key).await {
            Ok(raw) => raw,
            Err(Error::NotCached) => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Registry(format!(
                    "reading cached tags for {}: {}",
                    repository.repository_id(),
                    e
                )))
            }
        };
        let tags: Vec<String> = serde_json::from_slice(&raw)?;

        let mut images = Vec::with_capacity(tags.len());
        for tag in tags {
            let image = repository.with_tag(&tag);
            let key = CacheKey::manifest(username, &image);
            match self.cache.get(&key).await {
                Ok(raw) => images.push(serde_json::from_slice::<ImageInfo>(&raw)?),
                // Mid-warm gap: the tag list landed before its manifest.
                Err(Error::NotCached) => {
                    tracing::debug!(image = %image, "tag listed but manifest not cached yet");
                }
                Err(e) => {
                    return Err(Error::Registry(format!(
                        "reading cached manifest for {}: {}",
                        image, e
                    )))
                }
            }
        }
        Ok(images)
    }
}

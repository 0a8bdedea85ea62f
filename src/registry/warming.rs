//! Background worker that keeps the registry cache fresh for every image
//! the cluster currently runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future;
use tokio::sync::{watch, Semaphore};

use crate::cache::{Cache, CacheKey};
use crate::error::Error;
use crate::image::ImageRef;
use crate::registry::{ClientFactory, Credentials, ImageCreds, RegistryClient};

/// Refresh entries when they are within this duration of expiring.
pub fn refresh_horizon() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

/// How often to re-ask for the images in use and look for new tags.
pub const ASK_FOR_NEW_IMAGES_INTERVAL: Duration = Duration::from_secs(60);

/// Calls `cancel` on the wrapped client when it goes out of scope, however
/// the warm pass exits.
struct ClientGuard {
    inner: Arc<dyn RegistryClient>,
}

impl ClientGuard {
    fn new(inner: Arc<dyn RegistryClient>) -> Self {
        Self { inner }
    }

    fn client(&self) -> Arc<dyn RegistryClient> {
        self.inner.clone()
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

/// Iterates the images-in-use set and refreshes their tag lists and
/// manifests in the cache, bounded per host by `burst`.
pub struct Warmer {
    factory: Arc<dyn ClientFactory>,
    cache: Arc<dyn Cache>,
    burst: usize,
}

impl Warmer {
    pub fn new(factory: Arc<dyn ClientFactory>, cache: Arc<dyn Cache>, burst: usize) -> Self {
        Self {
            factory,
            cache,
            burst,
        }
    }

    /// Warm once, then tick once a minute until the stop signal flips.
    /// Exit is cooperative: the pass for the current image completes first.
    pub async fn run<F>(&self, mut stop: watch::Receiver<bool>, images_in_use: F)
    where
        F: Fn() -> ImageCreds + Send,
    {
        self.warm_all(&stop, &images_in_use).await;

        let mut ticker = tokio::time::interval(ASK_FOR_NEW_IMAGES_INTERVAL);
        // The first tick of an interval fires immediately; the initial pass
        // above already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        tracing::info!("warmer stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.warm_all(&stop, &images_in_use).await;
                }
            }
        }
    }

    async fn warm_all<F>(&self, stop: &watch::Receiver<bool>, images_in_use: &F)
    where
        F: Fn() -> ImageCreds + Send,
    {
        for (image, creds) in images_in_use() {
            if *stop.borrow() {
                return;
            }
            self.warm(&image, &creds).await;
        }
    }

    /// Refresh one image: store its tag list, then fetch every manifest
    /// that is missing from the cache or expiring soon.
    pub async fn warm(&self, image: &ImageRef, creds: &Credentials) {
        let guard = match self.factory.client_for(&image.host, creds) {
            Ok(client) => ClientGuard::new(client),
            Err(e) => {
                tracing::warn!(host = %image.host, error = %e, "creating registry client");
                return;
            }
        };
        let username = creds.username.clone();

        let tags = match guard.client().tags(image).await {
            Ok(tags) => tags,
            Err(e) => {
                if !e.is_cancellation() {
                    tracing::warn!(image = %image.repository_id(), error = %e, "requesting tags");
                }
                return;
            }
        };

        let raw = match serde_json::to_vec(&tags) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(image = %image.repository_id(), error = %e, "serializing tags");
                return;
            }
        };
        if let Err(e) = self.cache.set(&CacheKey::tags(&username, image), raw).await {
            tracing::warn!(image = %image.repository_id(), error = %e, "storing tags in cache");
            return;
        }

        // Partition the tags into manifests we have never cached and
        // manifests about to expire.
        let horizon = Utc::now() + refresh_horizon();
        let mut missing = Vec::new();
        let mut expiring = Vec::new();
        for tag in &tags {
            let candidate = image.with_tag(tag);
            let key = CacheKey::manifest(&username, &candidate);
            match self.cache.get_expiration(&key).await {
                Err(Error::NotCached) => missing.push(candidate),
                Ok(expiry) if expiry <= horizon => expiring.push(candidate),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(image = %candidate, error = %e, "reading cache expiration");
                }
            }
        }

        if missing.is_empty() && expiring.is_empty() {
            return;
        }
        tracing::info!(
            image = %image.repository_id(),
            total = tags.len(),
            missing = missing.len(),
            expiring = expiring.len(),
            "fetching manifests"
        );

        let to_update: Vec<ImageRef> = missing.into_iter().chain(expiring).collect();
        let fetchers = Arc::new(Semaphore::new(self.burst));
        let mut handles = Vec::with_capacity(to_update.len());
        for candidate in to_update {
            let client = guard.client();
            let cache = self.cache.clone();
            let username = username.clone();
            let fetchers = fetchers.clone();
            handles.push(tokio::spawn(async move {
                let _permit = fetchers.acquire().await.unwrap();
                let info = match client.manifest(&candidate).await {
                    Ok(info) => info,
                    Err(e) => {
                        if !e.is_cancellation() {
                            tracing::warn!(image = %candidate, error = %e, "requesting manifest");
                        }
                        return false;
                    }
                };
                let raw = match serde_json::to_vec(&info) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(image = %candidate, error = %e, "serializing manifest");
                        return false;
                    }
                };
                let key = CacheKey::manifest(&username, &candidate);
                if let Err(e) = cache.set(&key, raw).await {
                    tracing::warn!(image = %candidate, error = %e, "storing manifest in cache");
                    return false;
                }
                true
            }));
        }

        let results = future::join_all(handles).await;
        let updated = results
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        tracing::info!(image = %image.repository_id(), count = updated, "manifests updated");
    }
}

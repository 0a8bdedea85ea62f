//! Warmer behavior: tag lists and manifests land in the cache, fresh
//! entries are not refetched, the fan-out respects the burst ceiling, and
//! the loop stops cooperatively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use deckhand::cache::{Cache, CacheKey, MemoryCache};
use deckhand::error::Result;
use deckhand::registry::{
    refresh_horizon, ClientFactory, Credentials, ImageCreds, ImageInfo, RegistryClient, Warmer,
};
use deckhand::ImageRef;

struct MockClient {
    tags: Vec<String>,
    fetched: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancelled: AtomicBool,
}

impl MockClient {
    fn new(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            fetched: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }
}

#[async_trait]
impl RegistryClient for MockClient {
    async fn tags(&self, _image: &ImageRef) -> Result<Vec<String>> {
        Ok(self.tags.clone())
    }

    async fn manifest(&self, image: &ImageRef) -> Result<ImageInfo> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.fetched.lock().unwrap().push(image.tag.clone());
        Ok(ImageInfo {
            id: image.clone(),
            created_at: Utc::now(),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct MockFactory {
    client: Arc<MockClient>,
}

impl ClientFactory for MockFactory {
    fn client_for(&self, _host: &str, _creds: &Credentials) -> Result<Arc<dyn RegistryClient>> {
        Ok(self.client.clone())
    }
}

fn image_in_use() -> ImageRef {
    ImageRef::parse("quay.io/weaveworks/helloworld:master-a000001").unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn warm_populates_tags_and_manifests() {
    init_tracing();
    let client = Arc::new(MockClient::new(&["v1", "v2", "v3"]));
    let cache = Arc::new(MemoryCache::new());
    let warmer = Warmer::new(
        Arc::new(MockFactory {
            client: client.clone(),
        }),
        cache.clone(),
        4,
    );

    let image = image_in_use();
    warmer.warm(&image, &Credentials::anonymous()).await;

    let raw = cache.get(&CacheKey::tags("", &image)).await.unwrap();
    let tags: Vec<String> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(tags, vec!["v1", "v2", "v3"]);

    // Every tag's manifest is cached and safely beyond the refresh
    // horizon.
    let horizon = Utc::now() + refresh_horizon();
    for tag in &tags {
        let key = CacheKey::manifest("", &image.with_tag(tag));
        let raw = cache.get(&key).await.unwrap();
        let info: ImageInfo = serde_json::from_slice(&raw).unwrap();
        assert_eq!(&info.id.tag, tag);
        assert!(cache.get_expiration(&key).await.unwrap() > horizon);
    }
    assert_eq!(client.fetch_count(), 3);
    assert!(client.cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn fresh_manifests_are_not_refetched() {
    let client = Arc::new(MockClient::new(&["v1", "v2"]));
    let cache = Arc::new(MemoryCache::new());
    let warmer = Warmer::new(
        Arc::new(MockFactory {
            client: client.clone(),
        }),
        cache,
        4,
    );

    let image = image_in_use();
    warmer.warm(&image, &Credentials::anonymous()).await;
    assert_eq!(client.fetch_count(), 2);

    warmer.warm(&image, &Credentials::anonymous()).await;
    assert_eq!(client.fetch_count(), 2);
}

#[tokio::test]
async fn entries_near_expiry_are_refreshed() {
    let client = Arc::new(MockClient::new(&["v1"]));
    // TTL shorter than the refresh horizon: every entry is always
    // "expiring".
    let cache = Arc::new(MemoryCache::with_ttl(chrono::Duration::minutes(2)));
    let warmer = Warmer::new(
        Arc::new(MockFactory {
            client: client.clone(),
        }),
        cache,
        4,
    );

    let image = image_in_use();
    warmer.warm(&image, &Credentials::anonymous()).await;
    warmer.warm(&image, &Credentials::anonymous()).await;
    assert_eq!(client.fetch_count(), 2);
}

#[tokio::test]
async fn fan_out_respects_the_burst_ceiling() {
    let tags: Vec<String> = (0..12).map(|i| format!("v{}", i)).collect();
    let tag_refs: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
    let client = Arc::new(MockClient::new(&tag_refs));
    let warmer = Warmer::new(
        Arc::new(MockFactory {
            client: client.clone(),
        }),
        Arc::new(MemoryCache::new()),
        3,
    );

    warmer.warm(&image_in_use(), &Credentials::anonymous()).await;

    assert_eq!(client.fetch_count(), 12);
    assert!(client.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn run_stops_on_signal() {
    init_tracing();
    let client = Arc::new(MockClient::new(&["v1"]));
    let warmer = Arc::new(Warmer::new(
        Arc::new(MockFactory {
            client: client.clone(),
        }),
        Arc::new(MemoryCache::new()),
        2,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let warmer = warmer.clone();
        async move {
            let images = || -> ImageCreds {
                let mut images = HashMap::new();
                images.insert(image_in_use(), Credentials::anonymous());
                images
            };
            warmer.run(stop_rx, images).await;
        }
    });

    // Let the initial pass complete, then stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("warmer should stop promptly")
        .unwrap();
    assert!(client.fetch_count() >= 1);
}

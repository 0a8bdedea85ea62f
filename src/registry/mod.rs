//! Registry collaborators: the per-host client the warmer drives, and the
//! cache-backed view the release planner reads.

mod cached;
mod client;
pub mod warming;

pub use cached::CachedRegistry;
pub use client::{HttpClientFactory, HttpRegistryClient};
pub use warming::{refresh_horizon, Warmer, ASK_FOR_NEW_IMAGES_INTERVAL};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::image::ImageRef;

/// Registry authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// The images currently in use across the cluster, with the credentials
/// each one should be fetched with.
pub type ImageCreds = HashMap<ImageRef, Credentials>;

/// What the registry knows about one image: its reference and when it was
/// built. The creation instant is what "latest" is judged by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: ImageRef,
    pub created_at: DateTime<Utc>,
}

/// A client scoped to one registry host.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// All tags of the image's repository.
    async fn tags(&self, image: &ImageRef) -> Result<Vec<String>>;

    /// Metadata for one fully-qualified reference.
    async fn manifest(&self, image: &ImageRef) -> Result<ImageInfo>;

    /// Abort outstanding work. Dropping the client is equivalent.
    fn cancel(&self) {}
}

/// Produces a client for a registry host with the given credentials.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, host: &str, creds: &Credentials) -> Result<Arc<dyn RegistryClient>>;
}

/// The planner's read-side view of the registry: every known image of a
/// repository, typically answered from the warmed cache.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn repository_images(&self, repository: &ImageRef) -> Result<Vec<ImageInfo>>;
}

/// The image with the greatest creation timestamp, if any.
pub fn latest_image(images: &[ImageInfo]) -> Option<&ImageInfo> {
    images.iter().max_by_key(|info| info.created_at)
}

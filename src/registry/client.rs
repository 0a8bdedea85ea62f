use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::registry::{ClientFactory, Credentials, ImageInfo, RegistryClient};

/// Accept header for manifest requests. Listing the index types first makes
/// multi-arch repositories answer with their index rather than a
/// single-platform manifest.
const MANIFEST_ACCEPT_HEADER: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry v2 API client for a single host.
///
/// Handles the anonymous bearer-token flow: a 401 response's
/// WWW-Authenticate header names a realm; a token fetched from it is cached
/// and the request retried once.
pub struct HttpRegistryClient {
    host: String,
    creds: Credentials,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpRegistryClient {
    pub fn new(host: &str, creds: &Credentials, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            host: host.to_string(),
            creds: creds.clone(),
            http,
            token: RwLock::new(None),
        })
    }

    // Loopback registries are served over plain HTTP, the way container
    // tooling treats them as insecure by default.
    fn url(&self, path: &str) -> String {
        let scheme = if self.host.starts_with("localhost") || self.host.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        };
        format!("{}://{}{}", scheme, self.host, path)
    }

    async fn get(
        &self,
        path: &str,
        repository: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        let response = self.send(path, accept).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        // 401: fetch a token from the advertised realm and retry once.
        let www_auth = response
            .headers()
            .get("www-authenticate")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                Error::Registry(format!(
                    "{} returned 401 without WWW-Authenticate",
                    self.host
                ))
            })?;
        let token = self.fetch_token(&www_auth, repository).await?;
        *self.token.write().await = Some(token);
        self.send(path, accept).await
    }

    async fn send(&self, path: &str, accept: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.http.get(self.url(path));
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }
        if let Some(token) = self.token.read().await.as_ref() {
            request = request.bearer_auth(token);
        } else if !self.creds.username.is_empty() {
            request = request.basic_auth(&self.creds.username, Some(&self.creds.password));
        }
        Ok(request.send().await?)
    }

    /// Parse a WWW-Authenticate challenge and request a pull token from its
    /// realm. Registries differ on the token field name, so both `token`
    /// and `access_token` are accepted.
    async fn fetch_token(&self, www_auth: &str, repository: &str) -> Result<String> {
        let challenge = www_auth.strip_prefix("Bearer ").unwrap_or(www_auth);
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for part in challenge.split(',') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix("realm=") {
                realm = Some(value.trim_matches('"').to_string());
            } else if let Some(value) = part.strip_prefix("service=") {
                service = Some(value.trim_matches('"').to_string());
            } else if let Some(value) = part.strip_prefix("scope=") {
                scope = Some(value.trim_matches('"').to_string());
            }
        }

        let realm = realm.ok_or_else(|| {
            Error::Registry(format!("no realm in WWW-Authenticate from {}", self.host))
        })?;
        let scope = scope.unwrap_or_else(|| format!("repository:{}:pull", repository));

        let mut request = self.http.get(&realm).query(&[("scope", scope.as_str())]);
        if let Some(service) = &service {
            request = request.query(&[("service", service.as_str())]);
        }
        if !self.creds.username.is_empty() {
            request = request.basic_auth(&self.creds.username, Some(&self.creds.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "token endpoint {} returned {}",
                realm,
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await?;
        body.get("token")
            .and_then(|t| t.as_str())
            .or_else(|| body.get("access_token").and_then(|t| t.as_str()))
            .map(|t| t.to_string())
            .ok_or_else(|| Error::Registry(format!("no token in response from {}", realm)))
    }

    async fn manifest_json(&self, image: &ImageRef) -> Result<serde_json::Value> {
        let path = format!("/v2/{}/manifests/{}", image.repository, image.tag);
        let response = self
            .get(&path, &image.repository, Some(MANIFEST_ACCEPT_HEADER))
            .await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "fetching manifest for {}: HTTP {}",
                image,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn config_blob(&self, image: &ImageRef, digest: &str) -> Result<serde_json::Value> {
        let path = format!("/v2/{}/blobs/{}", image.repository, digest);
        let response = self.get(&path, &image.repository, None).await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "fetching config blob for {}: HTTP {}",
                image,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn tags(&self, image: &ImageRef) -> Result<Vec<String>> {
        let path = format!("/v2/{}/tags/list", image.repository);
        let response = self.get(&path, &image.repository, None).await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "listing tags for {}: HTTP {}",
                image.repository_id(),
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await?;
        let tags = body
            .get("tags")
            .and_then(|t| t.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(tags)
    }

    async fn manifest(&self, image: &ImageRef) -> Result<ImageInfo> {
        let mut manifest = self.manifest_json(image).await?;

        // A multi-arch index points at per-platform manifests; follow the
        // first one to reach a config blob.
        let media_type = manifest
            .get("mediaType")
            .and_then(|m| m.as_str())
            .unwrap_or("");
        if media_type.contains("manifest.list") || media_type.contains("image.index") {
            let digest = manifest
                .get("manifests")
                .and_then(|m| m.as_array())
                .and_then(|m| m.first())
                .and_then(|m| m.get("digest"))
                .and_then(|d| d.as_str())
                .ok_or_else(|| {
                    Error::Registry(format!("manifest index for {} lists no manifests", image))
                })?
                .to_string();
            let path = format!("/v2/{}/manifests/{}", image.repository, digest);
            let response = self
                .get(&path, &image.repository, Some(MANIFEST_ACCEPT_HEADER))
                .await?;
            if !response.status().is_success() {
                return Err(Error::Registry(format!(
                    "fetching platform manifest for {}: HTTP {}",
                    image,
                    response.status()
                )));
            }
            manifest = response.json().await?;
        }

        let config_digest = manifest
            .get("config")
            .and_then(|c| c.get("digest"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| Error::Registry(format!("manifest for {} has no config digest", image)))?
            .to_string();

        let config = self.config_blob(image, &config_digest).await?;
        let created = config
            .get("created")
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                Error::Registry(format!("config blob for {} has no creation time", image))
            })?;
        let created_at = created
            .parse::<DateTime<Utc>>()
            .map_err(|e| Error::Registry(format!("parsing creation time for {}: {}", image, e)))?;

        Ok(ImageInfo {
            id: image.clone(),
            created_at,
        })
    }
}

/// Builds one [`HttpRegistryClient`] per host.
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(&self, host: &str, creds: &Credentials) -> Result<Arc<dyn RegistryClient>> {
        Ok(Arc::new(HttpRegistryClient::new(
            host,
            creds,
            self.timeout,
        )?))
    }
}

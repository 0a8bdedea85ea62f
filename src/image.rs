/// OCI image reference types
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Registry host assumed when a reference does not name one.
pub const DEFAULT_REGISTRY_HOST: &str = "docker.io";

/// Tag assumed when a reference does not name one.
pub const DEFAULT_TAG: &str = "latest";

/// A fully-qualified image reference: registry host, repository, tag.
///
/// Two references denote the same repository when host and repository
/// match; they are equal when the tag matches too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageRef {
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Parse an image reference string.
    ///
    /// Missing hosts default to docker.io (bare names get the `library/`
    /// prefix, as the registry does); missing tags default to `latest`.
    /// A host is recognised by containing a dot or a port, or being
    /// `localhost`.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.trim().is_empty() {
            return Err(Error::ImageParse("empty reference".to_string()));
        }
        if reference.contains(char::is_whitespace) {
            return Err(Error::ImageParse(format!(
                "reference contains whitespace: {:?}",
                reference
            )));
        }

        // Split off the tag. A colon followed by a path separator belongs
        // to a registry port, not a tag.
        let (name, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') && !name.is_empty() => (name, tag),
            _ => (reference, DEFAULT_TAG),
        };

        let (host, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY_HOST.to_string(), name.to_string()),
            None => (
                DEFAULT_REGISTRY_HOST.to_string(),
                format!("library/{}", name),
            ),
        };

        if repository.is_empty() {
            return Err(Error::ImageParse(format!(
                "reference has no repository: {:?}",
                reference
            )));
        }

        Ok(Self {
            host,
            repository,
            tag: tag.to_string(),
        })
    }

    /// The `host/repository` prefix, without the tag.
    pub fn repository_id(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }

    /// Whether both references point at the same repository on the same
    /// host, regardless of tag.
    pub fn same_repository(&self, other: &ImageRef) -> bool {
        self.host == other.host && self.repository == other.repository
    }

    /// The same repository with a different tag.
    pub fn with_tag(&self, tag: &str) -> ImageRef {
        ImageRef {
            host: self.host.clone(),
            repository: self.repository.clone(),
            tag: tag.to_string(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repository, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ImageRef::parse(s)
    }
}

impl Serialize for ImageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ImageRef::parse(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_reference() {
        let r = ImageRef::parse("quay.io/weaveworks/helloworld:master-a000001").unwrap();
        assert_eq!(r.host, "quay.io");
        assert_eq!(r.repository, "weaveworks/helloworld");
        assert_eq!(r.tag, "master-a000001");
        assert_eq!(r.to_string(), "quay.io/weaveworks/helloworld:master-a000001");
    }

    #[test]
    fn parse_defaults() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.host, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "latest");

        let r = ImageRef::parse("weaveworks/helloworld").unwrap();
        assert_eq!(r.host, "docker.io");
        assert_eq!(r.repository, "weaveworks/helloworld");
    }

    #[test]
    fn parse_registry_port() {
        let r = ImageRef::parse("localhost:5000/helloworld").unwrap();
        assert_eq!(r.host, "localhost:5000");
        assert_eq!(r.repository, "helloworld");
        assert_eq!(r.tag, "latest");

        let r = ImageRef::parse("localhost:5000/helloworld:v1").unwrap();
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("has space:v1").is_err());
        assert!(ImageRef::parse("quay.io/:v1").is_err());
    }

    #[test]
    fn same_repository_ignores_tag() {
        let a = ImageRef::parse("quay.io/weaveworks/helloworld:1").unwrap();
        let b = a.with_tag("2");
        assert!(a.same_repository(&b));
        assert_ne!(a, b);

        let c = ImageRef::parse("quay.io/weaveworks/sidecar:1").unwrap();
        assert!(!a.same_repository(&c));
    }

    #[test]
    fn serde_round_trip() {
        let a = ImageRef::parse("quay.io/weaveworks/helloworld:master-a000001").unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"quay.io/weaveworks/helloworld:master-a000001\"");
        let back: ImageRef = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}

/// Workload identity and snapshot types
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::image::ImageRef;

/// Namespace that workloads belong to when their manifests name none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Stable identifier of a replicated workload: `namespace:kind/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadId {
    namespace: String,
    kind: String,
    name: String,
}

impl WorkloadId {
    pub fn new(namespace: &str, kind: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse an identifier of the form `namespace:kind/name`.
    pub fn parse(id: &str) -> Result<Self> {
        let invalid = || Error::WorkloadParse(format!("expected namespace:kind/name, got {:?}", id));
        let (namespace, rest) = id.split_once(':').ok_or_else(invalid)?;
        let (kind, name) = rest.split_once('/').ok_or_else(invalid)?;
        if namespace.is_empty() || kind.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(namespace, kind, name))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The (namespace, name) pair, the way the orchestrator addresses it.
    pub fn components(&self) -> (&str, &str) {
        (&self.namespace, &self.name)
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.kind, self.name)
    }
}

impl FromStr for WorkloadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WorkloadId::parse(s)
    }
}

impl Serialize for WorkloadId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WorkloadId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        WorkloadId::parse(&s).map_err(D::Error::custom)
    }
}

/// A container observed inside a running workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: ImageRef,
}

/// Snapshot of a workload as the cluster currently runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub containers: Vec<Container>,
}

/// A planned image change for one container: same repository, new tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRegrade {
    pub container: String,
    pub current: ImageRef,
    pub target: ImageRef,
}

//! Core of a continuous-deployment control system: it reconciles what a
//! container orchestrator is running with the manifests held in a git
//! repository, and drives image releases against that configuration.
//!
//! The moving parts:
//!
//! - [`release::Releaser`] computes and executes releases: filter the
//!   candidate workloads, mutate their manifests in a fresh clone, commit
//!   and push, then direct the cluster to re-apply them.
//! - [`cluster::Kubectl`] streams staged manifests to the orchestrator's
//!   command-line front-end, falling back to per-manifest invocations when
//!   a bulk attempt fails.
//! - [`registry::Warmer`] keeps tag lists and image manifests fresh in the
//!   [`cache`], which the planner reads instead of the network.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod git;
pub mod history;
pub mod image;
pub mod manifests;
pub mod registry;
pub mod release;
pub mod workload;

pub use cache::{Cache, CacheKey, DiskCache, MemoryCache};
pub use cluster::{Cluster, Kubectl, KubernetesCluster, RegradeSpec, SyncError};
pub use config::{ClusterConfig, GitConfig, WarmerConfig};
pub use error::{Error, Result};
pub use git::{Checkout, GitRepo, Repo};
pub use history::{EventWriter, TracingEventWriter};
pub use image::ImageRef;
pub use registry::{
    CachedRegistry, ClientFactory, Credentials, HttpClientFactory, ImageCreds, ImageInfo,
    Registry, RegistryClient, Warmer,
};
pub use release::{
    ImageSelector, ReleaseKind, ReleaseOutcome, ReleaseRequest, ReleaseResult, ReleaseStatus,
    Releaser, ResultError, WorkloadResult, WorkloadSpec,
};
pub use workload::{Container, ContainerRegrade, Workload, WorkloadId};

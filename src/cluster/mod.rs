//! Cluster collaborators: the observation/regrade seam the releaser talks
//! to, and the kubectl-backed sync engine behind it.

mod kubectl;

pub use kubectl::{Kubectl, KubernetesCluster, APPLY, DELETE};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::workload::{Workload, WorkloadId};

/// A manifest to resubmit for one workload.
#[derive(Debug, Clone)]
pub struct RegradeSpec {
    pub id: WorkloadId,
    pub manifest: Vec<u8>,
}

/// Per-manifest errors collected by a sync execute, keyed by the
/// identifier the manifest was staged under.
pub type SyncError = HashMap<String, Error>;

/// The orchestrator as the releaser sees it.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Every replicated workload currently running.
    async fn all_workloads(&self) -> Result<Vec<Workload>>;

    /// The subset of `ids` that is currently running.
    async fn some_workloads(&self, ids: &[WorkloadId]) -> Result<Vec<Workload>>;

    /// Resubmit the given manifests as a single transaction. The returned
    /// map carries an error message per failed workload and is empty on
    /// total success.
    async fn regrade(&self, specs: Vec<RegradeSpec>) -> Result<HashMap<WorkloadId, String>>;
}

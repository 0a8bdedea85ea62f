use std::collections::HashMap;
use std::path::Path;

use crate::git::Checkout;
use crate::manifests::WorkloadManifest;
use crate::workload::WorkloadId;

/// Scoped per-release state: the working clone, the repository index built
/// from it, and the mutated manifest for each updated workload.
///
/// The context owns the clone directory exclusively; dropping the context
/// removes it, on every exit path.
pub struct ReleaseContext {
    checkout: Checkout,
    /// What the repository defines, indexed at clone time.
    pub manifest_index: HashMap<WorkloadId, WorkloadManifest>,
    /// Mutated (or loaded) manifest per workload, consumed by the regrade
    /// action.
    pub controllers: HashMap<WorkloadId, Vec<u8>>,
}

impl ReleaseContext {
    pub fn new(checkout: Checkout, manifest_index: HashMap<WorkloadId, WorkloadManifest>) -> Self {
        Self {
            checkout,
            manifest_index,
            controllers: HashMap::new(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.checkout.path
    }

    pub fn manifest_root(&self) -> &Path {
        &self.checkout.manifest_root
    }

    pub fn key_file(&self) -> &Path {
        &self.checkout.key_file
    }
}

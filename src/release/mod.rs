//! Release requests, modes, and per-workload results.

mod context;
mod releaser;

pub use context::ReleaseContext;
pub use releaser::Releaser;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::workload::{ContainerRegrade, WorkloadId};

/// Selector token meaning every workload.
pub const WORKLOAD_SPEC_ALL: &str = "<all>";
/// Image selector token meaning the newest available tag per repository.
pub const IMAGE_SPEC_LATEST: &str = "<all latest>";
/// Image selector token meaning resubmit without changing images.
pub const IMAGE_SPEC_NONE: &str = "<no updates>";

/// One entry of a request's workload selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadSpec {
    All,
    Id(WorkloadId),
}

impl WorkloadSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        if spec == WORKLOAD_SPEC_ALL {
            Ok(WorkloadSpec::All)
        } else {
            Ok(WorkloadSpec::Id(WorkloadId::parse(spec)?))
        }
    }
}

/// Which image to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelector {
    /// The newest tag of each container's repository.
    Latest,
    /// No image change; resubmit what the repo holds.
    None,
    /// One specific reference.
    Ref(ImageRef),
}

impl ImageSelector {
    pub fn parse(spec: &str) -> Result<Self> {
        match spec {
            IMAGE_SPEC_LATEST => Ok(ImageSelector::Latest),
            IMAGE_SPEC_NONE => Ok(ImageSelector::None),
            other => Ok(ImageSelector::Ref(ImageRef::parse(other)?)),
        }
    }
}

/// Whether to perform the release or only report what it would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Plan,
    Execute,
}

/// A declarative release request.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub workloads: Vec<WorkloadSpec>,
    pub image: ImageSelector,
    pub kind: ReleaseKind,
    pub excludes: Vec<WorkloadId>,
}

impl ReleaseRequest {
    /// The requested workload set; `None` means all. When `<all>` occurs
    /// alongside specific identifiers, all wins.
    pub fn selected(&self) -> Option<BTreeSet<WorkloadId>> {
        let mut ids = BTreeSet::new();
        for spec in &self.workloads {
            match spec {
                WorkloadSpec::All => return None,
                WorkloadSpec::Id(id) => {
                    ids.insert(id.clone());
                }
            }
        }
        Some(ids)
    }

    pub fn mode(&self) -> ReleaseMode {
        match (self.selected().is_none(), &self.image) {
            (true, ImageSelector::Latest) => ReleaseMode::AllToLatest,
            (true, ImageSelector::None) => ReleaseMode::AllWithoutUpdate,
            (true, ImageSelector::Ref(_)) => ReleaseMode::AllForImage,
            (false, ImageSelector::Latest) => ReleaseMode::OneToLatest,
            (false, ImageSelector::None) => ReleaseMode::OneWithoutUpdate,
            (false, ImageSelector::Ref(_)) => ReleaseMode::One,
        }
    }
}

/// The six ways a (workload-selector, image-selector) pair can combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    AllToLatest,
    AllWithoutUpdate,
    AllForImage,
    OneToLatest,
    OneWithoutUpdate,
    One,
}

impl ReleaseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseMode::AllToLatest => "release_all_to_latest",
            ReleaseMode::AllWithoutUpdate => "release_all_without_update",
            ReleaseMode::AllForImage => "release_all_for_image",
            ReleaseMode::OneToLatest => "release_one_to_latest",
            ReleaseMode::OneWithoutUpdate => "release_one_without_update",
            ReleaseMode::One => "release_one",
        }
    }
}

/// Terminal status of one workload within a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    Success,
    Ignored,
    Skipped,
    Failed,
}

/// Why a workload was not (fully) released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultError {
    Excluded,
    NotIncluded,
    Locked,
    NotInCluster,
    NotInRepo,
    DifferentImage,
    DoesNotUseImage,
    ImageUpToDate,
    Other(String),
}

impl fmt::Display for ResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultError::Excluded => write!(f, "excluded"),
            ResultError::NotIncluded => write!(f, "not included"),
            ResultError::Locked => write!(f, "locked"),
            ResultError::NotInCluster => write!(f, "not running in cluster"),
            ResultError::NotInRepo => write!(f, "not found in repository"),
            ResultError::DifferentImage => write!(f, "a different image"),
            ResultError::DoesNotUseImage => write!(f, "does not use image"),
            ResultError::ImageUpToDate => write!(f, "image(s) up to date"),
            ResultError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// What happened to one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadResult {
    pub status: ReleaseStatus,
    pub error: Option<ResultError>,
    pub per_container: Vec<ContainerRegrade>,
}

impl WorkloadResult {
    pub fn ignored(error: ResultError) -> Self {
        Self {
            status: ReleaseStatus::Ignored,
            error: Some(error),
            per_container: Vec::new(),
        }
    }

    pub fn skipped(error: ResultError) -> Self {
        Self {
            status: ReleaseStatus::Skipped,
            error: Some(error),
            per_container: Vec::new(),
        }
    }

    pub fn success(per_container: Vec<ContainerRegrade>) -> Self {
        Self {
            status: ReleaseStatus::Success,
            error: None,
            per_container,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            status: ReleaseStatus::Failed,
            error: Some(ResultError::Other(message)),
            per_container: Vec::new(),
        }
    }
}

/// Per-workload outcome of a release, keyed by identifier.
pub type ReleaseResult = BTreeMap<WorkloadId, WorkloadResult>;

/// Everything a finished release reports: the per-workload map and, when
/// the action plan aborted, the terminal error.
pub struct ReleaseOutcome {
    pub results: ReleaseResult,
    pub error: Option<Error>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(workloads: Vec<WorkloadSpec>, image: ImageSelector) -> ReleaseRequest {
        ReleaseRequest {
            workloads,
            image,
            kind: ReleaseKind::Execute,
            excludes: Vec::new(),
        }
    }

    #[test]
    fn mode_dispatch_table() {
        let id = WorkloadId::parse("default:deployment/helloworld").unwrap();
        let image = ImageRef::parse("quay.io/weaveworks/helloworld:v2").unwrap();

        let cases = [
            (
                request(vec![WorkloadSpec::All], ImageSelector::Latest),
                ReleaseMode::AllToLatest,
            ),
            (
                request(vec![WorkloadSpec::All], ImageSelector::None),
                ReleaseMode::AllWithoutUpdate,
            ),
            (
                request(
                    vec![WorkloadSpec::All],
                    ImageSelector::Ref(image.clone()),
                ),
                ReleaseMode::AllForImage,
            ),
            (
                request(vec![WorkloadSpec::Id(id.clone())], ImageSelector::Latest),
                ReleaseMode::OneToLatest,
            ),
            (
                request(vec![WorkloadSpec::Id(id.clone())], ImageSelector::None),
                ReleaseMode::OneWithoutUpdate,
            ),
            (
                request(
                    vec![WorkloadSpec::Id(id.clone())],
                    ImageSelector::Ref(image),
                ),
                ReleaseMode::One,
            ),
        ];
        for (req, mode) in cases {
            assert_eq!(req.mode(), mode);
        }
    }

    #[test]
    fn all_wins_over_specific_ids() {
        let id = WorkloadId::parse("default:deployment/helloworld").unwrap();
        let req = request(
            vec![WorkloadSpec::Id(id), WorkloadSpec::All],
            ImageSelector::Latest,
        );
        assert!(req.selected().is_none());
        assert_eq!(req.mode(), ReleaseMode::AllToLatest);
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(WorkloadSpec::parse("<all>").unwrap(), WorkloadSpec::All);
        assert!(matches!(
            WorkloadSpec::parse("default:deployment/helloworld").unwrap(),
            WorkloadSpec::Id(_)
        ));
        assert!(WorkloadSpec::parse("not-a-workload").is_err());

        assert_eq!(
            ImageSelector::parse("<all latest>").unwrap(),
            ImageSelector::Latest
        );
        assert_eq!(
            ImageSelector::parse("<no updates>").unwrap(),
            ImageSelector::None
        );
        assert!(matches!(
            ImageSelector::parse("quay.io/weaveworks/helloworld:v2").unwrap(),
            ImageSelector::Ref(_)
        ));
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::cluster::{Cluster, RegradeSpec};
use crate::error::{Error, Result};
use crate::git::Repo;
use crate::history::EventWriter;
use crate::manifests;
use crate::registry::{latest_image, Registry};
use crate::release::{
    ImageSelector, ReleaseContext, ReleaseKind, ReleaseMode, ReleaseOutcome, ReleaseRequest,
    ReleaseResult, ReleaseStatus, ResultError, WorkloadResult,
};
use crate::workload::{ContainerRegrade, Workload, WorkloadId};

const MAX_SIMULTANEOUS_RELEASES: usize = 1;

/// A workload that survived filtering, with the image changes it needs.
/// An empty regrade list means "resubmit without updating".
struct Candidate {
    id: WorkloadId,
    regrades: Vec<ContainerRegrade>,
}

/// One step of the linear release plan.
enum Action {
    Clone,
    UpdateManifest {
        id: WorkloadId,
        regrades: Vec<ContainerRegrade>,
    },
    FindManifest {
        id: WorkloadId,
    },
    CommitAndPush {
        message: String,
    },
    Regrade {
        ids: Vec<WorkloadId>,
        cause: String,
    },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Clone => "clone",
            Action::UpdateManifest { .. } => "update_manifest",
            Action::FindManifest { .. } => "find_manifest",
            Action::CommitAndPush { .. } => "commit_and_push",
            Action::Regrade { .. } => "regrade_workloads",
        }
    }

    fn description(&self) -> String {
        match self {
            Action::Clone => "Clone the config repo.".to_string(),
            Action::UpdateManifest { id, regrades } => {
                let changes: Vec<String> = regrades
                    .iter()
                    .map(|r| format!("{} ({} -> {})", r.container, r.current, r.target))
                    .collect();
                format!(
                    "Update {} image(s) in the resource file for {}: {}.",
                    regrades.len(),
                    id,
                    changes.join(", ")
                )
            }
            Action::FindManifest { id } => {
                format!("Load the resource file for {}.", id)
            }
            Action::CommitAndPush { .. } => "Commit and push the config repo.".to_string(),
            Action::Regrade { ids, cause: _ } => {
                let names: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                format!("Regrade {} workload(s): {}.", ids.len(), names.join(", "))
            }
        }
    }
}

/// Computes and executes releases against the cluster and the config repo.
///
/// At most one release is in flight per process; a second attempt fails
/// immediately rather than queueing.
pub struct Releaser {
    cluster: Arc<dyn Cluster>,
    registry: Arc<dyn Registry>,
    repo: Arc<dyn Repo>,
    history: Arc<dyn EventWriter>,
    semaphore: Semaphore,
}

impl Releaser {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        registry: Arc<dyn Registry>,
        repo: Arc<dyn Repo>,
        history: Arc<dyn EventWriter>,
    ) -> Self {
        Self {
            cluster,
            registry,
            repo,
            history,
            semaphore: Semaphore::new(MAX_SIMULTANEOUS_RELEASES),
        }
    }

    /// Run one release. The sink receives incremental status lines for
    /// user display; the outcome carries the per-workload result map and,
    /// when an action aborted the plan, the terminal error.
    pub async fn release(
        &self,
        request: &ReleaseRequest,
        sink: &mut (dyn FnMut(String) + Send),
    ) -> Result<ReleaseOutcome> {
        let _permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| Error::ReleaseInProgress)?;

        let mode = request.mode();
        let begin = Instant::now();
        tracing::info!(mode = mode.as_str(), kind = ?request.kind, "starting release");

        sink("Calculating release actions.".to_string());
        sink(announce(request, mode));

        let (mut results, candidates, mut context) = self.plan(request, sink).await?;

        if candidates.is_empty() {
            sink("Nothing to do.".to_string());
            tracing::info!(mode = mode.as_str(), took = ?begin.elapsed(), "release complete");
            return Ok(ReleaseOutcome {
                results,
                error: None,
            });
        }

        let actions = build_actions(request, mode, &candidates);
        let error = self
            .execute(&actions, request.kind, sink, &mut context, &mut results)
            .await
            .err();

        tracing::info!(
            mode = mode.as_str(),
            took = ?begin.elapsed(),
            success = error.is_none(),
            "release finished"
        );
        Ok(ReleaseOutcome { results, error })
    }

    /// Observe cluster, repo, and registry; produce the result map, the
    /// surviving candidates, and the release context the actions run in.
    async fn plan(
        &self,
        request: &ReleaseRequest,
        sink: &mut (dyn FnMut(String) + Send),
    ) -> Result<(ReleaseResult, Vec<Candidate>, ReleaseContext)> {
        let workloads = self
            .cluster
            .all_workloads()
            .await
            .map_err(|e| Error::Cluster(format!("fetching all workloads: {}", e)))?;
        let running: BTreeMap<WorkloadId, Workload> = workloads
            .into_iter()
            .map(|workload| (workload.id.clone(), workload))
            .collect();

        // The filter needs repository contents, so the release context is
        // acquired here; the Clone action later validates it.
        let checkout = self
            .repo
            .clone_repo()
            .await
            .map_err(|e| Error::Git(format!("cloning the config repo: {}", e)))?;
        let manifest_index = manifests::scan(&checkout.manifest_root)?;
        let context = ReleaseContext::new(checkout, manifest_index);

        let selected = request.selected();
        let mut all_ids: std::collections::BTreeSet<WorkloadId> = running.keys().cloned().collect();
        all_ids.extend(context.manifest_index.keys().cloned());
        if let Some(ids) = &selected {
            all_ids.extend(ids.iter().cloned());
        }

        let mut results = ReleaseResult::new();
        let mut candidates = Vec::new();

        for id in all_ids {
            if let Some(ids) = &selected {
                if !ids.contains(&id) {
                    results.insert(id, WorkloadResult::ignored(ResultError::NotIncluded));
                    continue;
                }
            }
            if request.excludes.contains(&id) {
                results.insert(id, WorkloadResult::ignored(ResultError::Excluded));
                continue;
            }
            let Some(workload) = running.get(&id) else {
                results.insert(id, WorkloadResult::skipped(ResultError::NotInCluster));
                continue;
            };
            let Some(manifest) = context.manifest_index.get(&id) else {
                results.insert(id, WorkloadResult::skipped(ResultError::NotInRepo));
                continue;
            };
            // A specific image that no container's repository matches makes
            // the workload irrelevant, locked or not.
            if let ImageSelector::Ref(target) = &request.image {
                if !workload
                    .containers
                    .iter()
                    .any(|c| c.image.same_repository(target))
                {
                    results.insert(id, WorkloadResult::ignored(ResultError::DifferentImage));
                    continue;
                }
            }
            if manifest.locked {
                results.insert(id, WorkloadResult::skipped(ResultError::Locked));
                continue;
            }

            match &request.image {
                ImageSelector::Ref(target) => {
                    let mut regrades = Vec::new();
                    for container in &workload.containers {
                        if !container.image.same_repository(target) {
                            continue;
                        }
                        if &container.image == target {
                            sink(format!(
                                "Image {} is already released; skipping.",
                                container.image
                            ));
                            continue;
                        }
                        regrades.push(ContainerRegrade {
                            container: container.name.clone(),
                            current: container.image.clone(),
                            target: target.clone(),
                        });
                    }
                    if regrades.is_empty() {
                        results.insert(id, WorkloadResult::ignored(ResultError::ImageUpToDate));
                        continue;
                    }
                    self.admit(request, id, regrades, &mut results, &mut candidates);
                }
                ImageSelector::Latest => {
                    let mut regrades = Vec::new();
                    let mut had_images = false;
                    for container in &workload.containers {
                        let images = self
                            .registry
                            .repository_images(&container.image)
                            .await
                            .map_err(|e| {
                                Error::Registry(format!("fetching images for {}: {}", id, e))
                            })?;
                        let Some(latest) = latest_image(&images) else {
                            sink(format!(
                                "No images available for {}; skipping.",
                                container.image.repository_id()
                            ));
                            continue;
                        };
                        had_images = true;
                        if latest.id == container.image {
                            continue;
                        }
                        regrades.push(ContainerRegrade {
                            container: container.name.clone(),
                            current: container.image.clone(),
                            target: latest.id.clone(),
                        });
                    }
                    if regrades.is_empty() {
                        let result = if had_images {
                            WorkloadResult::skipped(ResultError::ImageUpToDate)
                        } else {
                            WorkloadResult::ignored(ResultError::DoesNotUseImage)
                        };
                        results.insert(id, result);
                        continue;
                    }
                    self.admit(request, id, regrades, &mut results, &mut candidates);
                }
                ImageSelector::None => {
                    self.admit(request, id, Vec::new(), &mut results, &mut candidates);
                }
            }
        }

        Ok((results, candidates, context))
    }

    /// Record a workload as releasable. A plan-only release reports empty
    /// update lists because nothing will be applied.
    fn admit(
        &self,
        request: &ReleaseRequest,
        id: WorkloadId,
        regrades: Vec<ContainerRegrade>,
        results: &mut ReleaseResult,
        candidates: &mut Vec<Candidate>,
    ) {
        let reported = match request.kind {
            ReleaseKind::Execute => regrades.clone(),
            ReleaseKind::Plan => Vec::new(),
        };
        results.insert(id.clone(), WorkloadResult::success(reported));
        candidates.push(Candidate { id, regrades });
    }

    /// Run the plan in order. Descriptions always reach the sink; bodies
    /// only run under `Execute`. The first failing action aborts the rest.
    async fn execute(
        &self,
        actions: &[Action],
        kind: ReleaseKind,
        sink: &mut (dyn FnMut(String) + Send),
        context: &mut ReleaseContext,
        results: &mut ReleaseResult,
    ) -> Result<()> {
        for action in actions {
            let description = action.description();
            sink(description.clone());
            tracing::info!(description = %description, "release action");
            if kind == ReleaseKind::Plan {
                continue;
            }

            let begin = Instant::now();
            let outcome = self.run_action(action, context, results).await;
            tracing::debug!(
                action = action.name(),
                took = ?begin.elapsed(),
                success = outcome.is_ok(),
                "action finished"
            );
            match outcome {
                Ok(result) => {
                    if !result.is_empty() {
                        sink(result);
                    }
                }
                Err(e) => {
                    sink(e.to_string());
                    tracing::warn!(action = action.name(), error = %e, "release action failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_action(
        &self,
        action: &Action,
        context: &mut ReleaseContext,
        results: &mut ReleaseResult,
    ) -> Result<String> {
        match action {
            Action::Clone => {
                if !context.repo_path().is_dir() {
                    return Err(Error::Git(format!(
                        "the repo path ({}) is not valid",
                        context.repo_path().display()
                    )));
                }
                if !context.key_file().exists() {
                    return Err(Error::Git(format!(
                        "the repo key ({}) is not valid",
                        context.key_file().display()
                    )));
                }
                Ok("Clone OK.".to_string())
            }

            Action::UpdateManifest { id, regrades } => {
                let file = self.single_manifest_file(context, id)?;
                let Some(file) = file else {
                    return Ok(format!("no resource file found for {}; skipping", id));
                };
                let mut def = tokio::fs::read(&file).await?;
                // Accumulate on the same document so several images in one
                // file all land.
                for regrade in regrades {
                    def = manifests::update_image(&def, &regrade.target).map_err(|e| {
                        Error::Manifest(format!("updating image {} for {}: {}", regrade.target, id, e))
                    })?;
                }
                tokio::fs::write(&file, &def).await?;
                context.controllers.insert(id.clone(), def);
                Ok("Updated resource file OK.".to_string())
            }

            Action::FindManifest { id } => {
                let file = self.single_manifest_file(context, id)?;
                let Some(file) = file else {
                    return Ok(format!("no resource file found for {}; skipping", id));
                };
                let def = tokio::fs::read(&file).await?;
                context.controllers.insert(id.clone(), def);
                Ok("Found resource file OK.".to_string())
            }

            Action::CommitAndPush { message } => {
                if !context.repo_path().is_dir() {
                    return Err(Error::Git(format!(
                        "the repo path ({}) is not valid",
                        context.repo_path().display()
                    )));
                }
                let result = self
                    .repo
                    .commit_and_push(context.repo_path(), context.key_file(), message)
                    .await?;
                if result.is_empty() {
                    Ok(format!("Pushed commit: {}", message))
                } else {
                    Ok(result)
                }
            }

            Action::Regrade { ids, cause } => {
                let mut specs = Vec::new();
                let mut attempted = Vec::new();
                for id in ids {
                    match context.controllers.get(id) {
                        Some(def) => {
                            let (namespace, name) = id.components();
                            self.history.log_event(
                                namespace,
                                name,
                                &format!("Starting regrade {}", cause),
                            );
                            specs.push(RegradeSpec {
                                id: id.clone(),
                                manifest: def.clone(),
                            });
                            attempted.push(id.clone());
                        }
                        None => {
                            results.insert(
                                id.clone(),
                                WorkloadResult::failed(
                                    "no pod controller in release context; skipping regrade"
                                        .to_string(),
                                ),
                            );
                        }
                    }
                }

                let errors = self
                    .cluster
                    .regrade(specs)
                    .await
                    .map_err(|e| Error::Cluster(format!("regrading workloads: {}", e)))?;

                for id in &attempted {
                    let (namespace, name) = id.components();
                    match errors.get(id) {
                        None => {
                            self.history.log_event(
                                namespace,
                                name,
                                &format!("Regrade {}: done", cause),
                            );
                        }
                        Some(err) => {
                            self.history.log_event(
                                namespace,
                                name,
                                &format!("Regrade {}: failed: {}", cause, err),
                            );
                            if let Some(entry) = results.get_mut(id) {
                                entry.status = ReleaseStatus::Failed;
                                entry.error = Some(ResultError::Other(err.clone()));
                            }
                        }
                    }
                }
                Ok(String::new())
            }
        }
    }

    /// The single file defining a workload; more than one is an error,
    /// none is a skip.
    fn single_manifest_file(
        &self,
        context: &ReleaseContext,
        id: &WorkloadId,
    ) -> Result<Option<std::path::PathBuf>> {
        let Some(manifest) = context.manifest_index.get(id) else {
            return Ok(None);
        };
        match manifest.files.as_slice() {
            [] => Ok(None),
            [file] => Ok(Some(file.clone())),
            files => {
                let names: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
                Err(Error::Manifest(format!(
                    "multiple resource files found for {}: {}",
                    id,
                    names.join(", ")
                )))
            }
        }
    }
}

/// First status line describing what the release is about to do.
fn announce(request: &ReleaseRequest, mode: ReleaseMode) -> String {
    let ids = || {
        request
            .selected()
            .map(|ids| {
                ids.iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    };
    match (mode, &request.image) {
        (ReleaseMode::AllToLatest, _) => {
            "I'm going to release all workloads to their latest images.".to_string()
        }
        (ReleaseMode::AllWithoutUpdate, _) => {
            "I'm going to release all workloads using the config from the git repo, without updating it.".to_string()
        }
        (ReleaseMode::AllForImage, ImageSelector::Ref(target)) => format!(
            "I'm going to release image {} to all workloads that would use it.",
            target
        ),
        (ReleaseMode::OneToLatest, _) => {
            format!("I'm going to release the latest images for {}.", ids())
        }
        (ReleaseMode::OneWithoutUpdate, _) => format!(
            "I'm going to release {} using the config from the git repo, without updating it.",
            ids()
        ),
        (ReleaseMode::One, ImageSelector::Ref(target)) => {
            format!("I'm going to release image {} to {}.", target, ids())
        }
        // The mode table makes other combinations unrepresentable.
        _ => "Calculating release actions.".to_string(),
    }
}

fn build_actions(request: &ReleaseRequest, mode: ReleaseMode, candidates: &[Candidate]) -> Vec<Action> {
    let mut actions = vec![Action::Clone];
    let mut any_updates = false;
    for candidate in candidates {
        if candidate.regrades.is_empty() {
            actions.push(Action::FindManifest {
                id: candidate.id.clone(),
            });
        } else {
            any_updates = true;
            actions.push(Action::UpdateManifest {
                id: candidate.id.clone(),
                regrades: candidate.regrades.clone(),
            });
        }
    }

    let ids: Vec<WorkloadId> = candidates.iter().map(|c| c.id.clone()).collect();
    let names = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    if any_updates {
        actions.push(Action::CommitAndPush {
            message: commit_message(request, mode, &names),
        });
    }

    actions.push(Action::Regrade {
        ids,
        cause: cause(request, mode),
    });
    actions
}

fn commit_message(request: &ReleaseRequest, mode: ReleaseMode, names: &str) -> String {
    match (&request.image, mode) {
        (ImageSelector::Ref(target), ReleaseMode::AllForImage) => {
            format!("Release {} to all workloads", target)
        }
        (ImageSelector::Ref(target), _) => format!("Release {} to {}", target, names),
        (_, ReleaseMode::AllToLatest) => "Release latest images to all workloads".to_string(),
        _ => format!("Release latest images to {}", names),
    }
}

fn cause(request: &ReleaseRequest, mode: ReleaseMode) -> String {
    match (&request.image, mode) {
        (ImageSelector::Ref(target), ReleaseMode::AllForImage) => {
            format!("{} (to all workloads)", target)
        }
        (ImageSelector::Ref(target), _) => target.to_string(),
        (ImageSelector::Latest, ReleaseMode::AllToLatest) => {
            "latest images (to all workloads)".to_string()
        }
        (ImageSelector::Latest, _) => "latest images".to_string(),
        (ImageSelector::None, ReleaseMode::AllWithoutUpdate) => {
            "without update (all workloads)".to_string()
        }
        (ImageSelector::None, _) => "without update".to_string(),
    }
}

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::cluster::{Cluster, RegradeSpec, SyncError};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::image::ImageRef;
use crate::manifests;
use crate::workload::{Container, Workload, WorkloadId, DEFAULT_NAMESPACE};

pub const DELETE: &str = "delete";
pub const APPLY: &str = "apply";

/// Deletes run before applies so rename-style changes are well-defined.
const OPERATIONS: [&str; 2] = [DELETE, APPLY];

/// Deadline on each invocation of the external tool. A stalled cluster
/// endpoint must not wedge the release pipeline.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

struct StagedManifest {
    id: String,
    namespace: Option<String>,
    bytes: Vec<u8>,
}

impl StagedManifest {
    fn has_default_namespace(&self) -> bool {
        matches!(self.namespace.as_deref(), None | Some(DEFAULT_NAMESPACE))
    }
}

#[derive(Default)]
struct ChangeSet {
    objs: HashMap<String, Vec<StagedManifest>>,
}

impl ChangeSet {
    fn stage(&mut self, op: &str, obj: StagedManifest) {
        self.objs.entry(op.to_string()).or_default().push(obj);
    }

    fn clear(&mut self) {
        self.objs.clear();
    }

    fn is_empty(&self) -> bool {
        self.objs.values().all(|list| list.is_empty())
    }
}

/// Streams staged manifests to the external `kubectl` front-end.
///
/// Manifests are grouped by operation and namespace and sent as one
/// multi-document stream per group; if a bulk invocation fails, each
/// manifest in the group is retried on its own so a single bad document
/// cannot poison the batch.
pub struct Kubectl {
    exe: String,
    config: ClusterConfig,
    timeout: Duration,
    change_set: ChangeSet,
}

impl Kubectl {
    pub fn new(exe: &str, config: ClusterConfig) -> Self {
        Self {
            exe: exe.to_string(),
            config,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            change_set: ChangeSet::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connect_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let flags = [
            ("--server", &self.config.host),
            ("--username", &self.config.username),
            ("--password", &self.config.password),
            ("--client-certificate", &self.config.cert_file),
            ("--certificate-authority", &self.config.ca_file),
            ("--client-key", &self.config.key_file),
            ("--token", &self.config.bearer_token),
        ];
        for (flag, value) in flags {
            if !value.is_empty() {
                args.push(format!("{}={}", flag, value));
            }
        }
        args
    }

    /// Append a manifest to the change-set under the given operation.
    /// The change-set persists across stage calls until `execute`.
    pub fn stage(&mut self, op: &str, id: &str, manifest: &[u8]) {
        self.change_set.stage(
            op,
            StagedManifest {
                id: id.to_string(),
                namespace: manifests::manifest_namespace(manifest),
                bytes: manifest.to_vec(),
            },
        );
    }

    /// Drop everything staged so far.
    pub fn clear(&mut self) {
        self.change_set.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.change_set.is_empty()
    }

    /// Flush the change-set: deletes first, then applies; within each
    /// operation, default-namespace manifests are sent with an explicit
    /// `--namespace default` and the rest trust their own metadata.
    /// Per-manifest failures land in `errs`; the change-set is empty when
    /// this returns, whatever the outcome.
    pub async fn execute(&mut self, errs: &mut SyncError) {
        let staged = std::mem::take(&mut self.change_set);

        for op in OPERATIONS {
            let Some(objs) = staged.objs.get(op) else {
                continue;
            };
            let (default_set, other_set): (Vec<&StagedManifest>, Vec<&StagedManifest>) =
                objs.iter().partition(|obj| obj.has_default_namespace());

            let mut default_args = vec![op.to_string()];
            default_args.push("--namespace".to_string());
            default_args.push(DEFAULT_NAMESPACE.to_string());
            self.exec_batch(&default_args, &default_set, errs).await;

            let other_args = vec![op.to_string()];
            self.exec_batch(&other_args, &other_set, errs).await;
        }
    }

    /// Bulk attempt, then one invocation per manifest on failure.
    async fn exec_batch(&self, args: &[String], objs: &[&StagedManifest], errs: &mut SyncError) {
        if objs.is_empty() {
            return;
        }

        let mut stream = Vec::new();
        for obj in objs {
            stream.extend_from_slice(b"---\n");
            stream.extend_from_slice(&obj.bytes);
            if !obj.bytes.ends_with(b"\n") {
                stream.push(b'\n');
            }
        }

        if self.invoke(args, &stream).await.is_ok() {
            return;
        }

        for obj in objs {
            if let Err(e) = self.invoke(args, &obj.bytes).await {
                errs.insert(obj.id.clone(), e);
            }
        }
    }

    async fn invoke(&self, args: &[String], stdin_data: &[u8]) -> Result<()> {
        let mut full_args = self.connect_args();
        full_args.extend(args.iter().cloned());
        full_args.push("-f".to_string());
        full_args.push("-".to_string());

        let begin = Instant::now();
        let result = self.run(&full_args, stdin_data).await;
        let (err, output) = match &result {
            Ok(stdout) => (None, stdout.trim().to_string()),
            Err(e) => (Some(e.to_string()), String::new()),
        };
        tracing::info!(
            cmd = %format!("{} {}", self.exe, full_args.join(" ")),
            took = ?begin.elapsed(),
            err = err.as_deref().unwrap_or("none"),
            output = %output,
            "ran cluster tool"
        );
        result.map(|_| ())
    }

    async fn run(&self, args: &[String], stdin_data: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.exe)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Cluster(format!("spawning {}: {}", self.exe, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::time::timeout(self.timeout, stdin.write_all(stdin_data))
                .await
                .map_err(|_| {
                    Error::Cluster(format!(
                        "writing to {}: timed out after {:?}",
                        self.exe, self.timeout
                    ))
                })?
                .map_err(|e| Error::Cluster(format!("writing to {}: {}", self.exe, e)))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::Cluster(format!(
                    "running {}: timed out after {:?}",
                    self.exe, self.timeout
                ))
            })?
            .map_err(|e| Error::Cluster(format!("waiting for {}: {}", self.exe, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Cluster(format!(
                "running {}: {}",
                self.exe,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a read-only query and return its standard output.
    async fn query(&self, args: &[&str]) -> Result<String> {
        let mut full_args = self.connect_args();
        full_args.extend(args.iter().map(|a| a.to_string()));
        self.run(&full_args, &[]).await
    }
}

/// The orchestrator collaborator, observation and regrade both delegated
/// to the command-line front-end.
pub struct KubernetesCluster {
    kubectl: Mutex<Kubectl>,
}

impl KubernetesCluster {
    pub fn new(exe: &str, config: ClusterConfig) -> Self {
        Self {
            kubectl: Mutex::new(Kubectl::new(exe, config)),
        }
    }

    fn parse_workloads(raw: &str) -> Result<Vec<Workload>> {
        let body: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::Cluster(format!("parsing workload list: {}", e)))?;
        let items = body
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();

        let mut workloads = Vec::with_capacity(items.len());
        for item in items {
            let kind = item
                .get("kind")
                .and_then(|k| k.as_str())
                .unwrap_or("deployment")
                .to_ascii_lowercase();
            let Some(metadata) = item.get("metadata") else {
                continue;
            };
            let Some(name) = metadata.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            let namespace = metadata
                .get("namespace")
                .and_then(|ns| ns.as_str())
                .unwrap_or(DEFAULT_NAMESPACE);
            let id = WorkloadId::new(namespace, &kind, name);

            let mut containers = Vec::new();
            let specs = item
                .pointer("/spec/template/spec/containers")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for spec in specs {
                let Some(name) = spec.get("name").and_then(|n| n.as_str()) else {
                    continue;
                };
                let Some(image) = spec.get("image").and_then(|i| i.as_str()) else {
                    continue;
                };
                match ImageRef::parse(image) {
                    Ok(image) => containers.push(Container {
                        name: name.to_string(),
                        image,
                    }),
                    Err(e) => {
                        tracing::warn!(workload = %id, image = %image, error = %e, "skipping unparseable image");
                    }
                }
            }
            workloads.push(Workload { id, containers });
        }
        Ok(workloads)
    }
}

#[async_trait]
impl Cluster for KubernetesCluster {
    async fn all_workloads(&self) -> Result<Vec<Workload>> {
        let kubectl = self.kubectl.lock().await;
        let raw = kubectl
            .query(&["get", "deployments", "--all-namespaces", "-o", "json"])
            .await
            .map_err(|e| Error::Cluster(format!("listing workloads: {}", e)))?;
        Self::parse_workloads(&raw)
    }

    async fn some_workloads(&self, ids: &[WorkloadId]) -> Result<Vec<Workload>> {
        let all = self.all_workloads().await?;
        Ok(all
            .into_iter()
            .filter(|workload| ids.contains(&workload.id))
            .collect())
    }

    async fn regrade(&self, specs: Vec<RegradeSpec>) -> Result<HashMap<WorkloadId, String>> {
        let mut kubectl = self.kubectl.lock().await;
        for spec in &specs {
            kubectl.stage(APPLY, &spec.id.to_string(), &spec.manifest);
        }
        let mut errs = SyncError::new();
        kubectl.execute(&mut errs).await;

        let mut results = HashMap::new();
        for (id, err) in errs {
            match WorkloadId::parse(&id) {
                Ok(id) => {
                    results.insert(id, err.to_string());
                }
                Err(_) => {
                    tracing::warn!(id = %id, error = %err, "sync error for unknown manifest id");
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_args_skip_empty_fields() {
        let kubectl = Kubectl::new(
            "kubectl",
            ClusterConfig {
                host: "https://cluster.example.com".to_string(),
                bearer_token: "s3cret".to_string(),
                ..Default::default()
            },
        );
        let args = kubectl.connect_args();
        assert_eq!(
            args,
            vec![
                "--server=https://cluster.example.com".to_string(),
                "--token=s3cret".to_string(),
            ]
        );
    }

    #[test]
    fn parse_workloads_reads_pod_template_containers() {
        let raw = r#"{
          "items": [
            {
              "kind": "Deployment",
              "metadata": {"name": "helloworld", "namespace": "default"},
              "spec": {"template": {"spec": {"containers": [
                {"name": "goodbyeworld", "image": "quay.io/weaveworks/helloworld:master-a000001"}
              ]}}}
            }
          ]
        }"#;
        let workloads = KubernetesCluster::parse_workloads(raw).unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(
            workloads[0].id.to_string(),
            "default:deployment/helloworld"
        );
        assert_eq!(workloads[0].containers[0].name, "goodbyeworld");
    }
}

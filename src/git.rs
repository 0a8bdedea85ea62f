//! Source-control collaborator: a fresh checkout per release, and a
//! commit-and-push primitive. The transport itself is the `git` binary's
//! problem.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::config::GitConfig;
use crate::error::{Error, Result};

/// A working clone plus the credential used to make it. Owns its
/// directory: dropping the checkout removes the tree.
pub struct Checkout {
    pub path: PathBuf,
    /// Where resource manifests live inside the clone.
    pub manifest_root: PathBuf,
    pub key_file: PathBuf,
    _temp: Option<TempDir>,
}

impl Checkout {
    pub fn new(temp: TempDir, path: PathBuf, manifest_root: PathBuf, key_file: PathBuf) -> Self {
        Self {
            path,
            manifest_root,
            key_file,
            _temp: Some(temp),
        }
    }

    /// A checkout over a directory owned by someone else. Used by tests
    /// and callers that manage their own trees.
    pub fn at(path: PathBuf, manifest_root: PathBuf, key_file: PathBuf) -> Self {
        Self {
            path,
            manifest_root,
            key_file,
            _temp: None,
        }
    }
}

/// Clone / commit-and-push collaborator.
#[async_trait]
pub trait Repo: Send + Sync {
    async fn clone_repo(&self) -> Result<Checkout>;

    /// Persist the working tree. Returns a human-readable result string;
    /// empty means a commit was pushed without incident.
    async fn commit_and_push(&self, path: &Path, key_file: &Path, message: &str)
        -> Result<String>;
}

/// Deadline on each git invocation. A stalled transport or an unexpected
/// SSH prompt must not hold the release gate forever.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Repo collaborator backed by the `git` binary and a deploy key.
pub struct GitRepo {
    config: GitConfig,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(config: GitConfig) -> Self {
        Self {
            config,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_git(&self, key_file: &Path, args: &[&str]) -> Result<String> {
        let begin = Instant::now();
        let child = Command::new("git")
            .args(args)
            .env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o StrictHostKeyChecking=no -o BatchMode=yes",
                    key_file.display()
                ),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Git(format!("spawning git: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::Git(format!(
                    "running git {}: timed out after {:?}",
                    args.first().copied().unwrap_or("?"),
                    self.timeout
                ))
            })?
            .map_err(|e| Error::Git(format!("waiting for git: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::info!(
            cmd = %format!("git {}", args.join(" ")),
            took = ?begin.elapsed(),
            exit = ?output.status.code(),
            output = %stdout,
            "ran git"
        );

        if !output.status.success() {
            return Err(Error::Git(format!("running git {}: {}", args[0], stderr)));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl Repo for GitRepo {
    async fn clone_repo(&self) -> Result<Checkout> {
        let temp = tempfile::Builder::new()
            .prefix("deckhand-release-")
            .tempdir()
            .map_err(|e| Error::Git(format!("creating clone dir: {}", e)))?;
        let path = temp.path().join("repo");

        self.run_git(
            &self.config.key_path,
            &[
                "clone",
                "--branch",
                &self.config.branch,
                "--single-branch",
                &self.config.url,
                path.to_str()
                    .ok_or_else(|| Error::Git("clone path is not UTF-8".to_string()))?,
            ],
        )
        .await?;

        let manifest_root = if self.config.path.is_empty() {
            path.clone()
        } else {
            path.join(&self.config.path)
        };
        Ok(Checkout::new(
            temp,
            path,
            manifest_root,
            self.config.key_path.clone(),
        ))
    }

    async fn commit_and_push(
        &self,
        path: &Path,
        key_file: &Path,
        message: &str,
    ) -> Result<String> {
        let workdir = path
            .to_str()
            .ok_or_else(|| Error::Git("repo path is not UTF-8".to_string()))?;

        let status = self
            .run_git(key_file, &["-C", workdir, "status", "--porcelain"])
            .await?;
        if status.is_empty() {
            return Ok("no changes to push".to_string());
        }

        self.run_git(
            key_file,
            &[
                "-C",
                workdir,
                "-c",
                "user.name=deckhand",
                "-c",
                "user.email=deckhand@localhost",
                "commit",
                "-a",
                "-m",
                message,
            ],
        )
        .await?;
        self.run_git(
            key_file,
            &["-C", workdir, "push", "origin", &self.config.branch],
        )
        .await?;
        Ok(String::new())
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default ceiling on concurrent manifest fetches against one registry host.
pub const DEFAULT_BURST: usize = 10;

/// Connection settings handed to the external orchestrator tool.
///
/// Every field is optional; an empty string means the corresponding flag is
/// omitted from the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub ca_file: String,
}

/// Where the declarative configuration lives and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Clone URL of the config repo.
    pub url: String,
    /// Branch holding the manifests.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Subdirectory within the repo that holds resource manifests.
    /// Empty means the repo root.
    #[serde(default)]
    pub path: String,
    /// Deploy key used for clone and push.
    pub key_path: PathBuf,
}

fn default_branch() -> String {
    "master".to_string()
}

/// Tuning for the registry cache warmer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmerConfig {
    /// Upper bound on in-flight manifest fetches per registry host.
    #[serde(default = "default_burst")]
    pub burst: usize,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            burst: DEFAULT_BURST,
        }
    }
}

fn default_burst() -> usize {
    DEFAULT_BURST
}

//! Capability traits for the cluster, package manager and cluster lifecycle, plus
//! the subprocess implementations used by `labctl`.
mod command;
mod helm;
mod k3d;
mod kubectl;

pub use command::{classify_failure, CommandOutput, CommandRunner};
pub use helm::{helm_upgrade_args, HelmBackend};
pub use k3d::K3dLifecycle;
pub use kubectl::KubectlBackend;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub effect: String,
}

/// A cluster node as reported by the API server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInfo {
    pub name: String,
    pub labels: Labels,
    pub taints: Vec<Taint>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_taint(mut self, key: impl Into<String>, effect: impl Into<String>) -> Self {
        self.taints.push(Taint {
            key: key.into(),
            value: None,
            effect: effect.into(),
        });
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Where a manifest comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Path(PathBuf),
    Content(String),
    Url(String),
}

impl ManifestSource {
    pub fn describe(&self) -> String {
        match self {
            ManifestSource::Path(path) => path.display().to_string(),
            ManifestSource::Content(content) => format!("inline manifest ({} bytes)", content.len()),
            ManifestSource::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replica counts of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub desired: i64,
    pub ready: i64,
}

impl WorkloadStatus {
    pub fn is_ready(&self) -> bool {
        self.ready >= self.desired
    }
}

/// Fully resolved Helm release, values already merged.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseSpec {
    pub name: String,
    pub chart: String,
    pub version: Option<String>,
    pub namespace: String,
    pub values: serde_yaml::Mapping,
    pub wait: bool,
    pub timeout: Duration,
    pub reuse_values: bool,
    pub create_namespace: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

/// Kubernetes API operations.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn namespace_exists(&self, name: &str) -> Result<bool>;
    async fn create_namespace(&self, name: &str) -> Result<()>;
    /// Overwrites existing values for the given keys.
    async fn label_namespace(&self, name: &str, labels: &Labels) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Labels>>;
    async fn create_secret(&self, namespace: &str, name: &str, data: &Labels) -> Result<()>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// Nodes in the order the API server returns them.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;
    async fn label_node(&self, node: &str, labels: &Labels) -> Result<()>;
    /// Absent labels are not an error.
    async fn remove_node_label(&self, node: &str, key: &str) -> Result<()>;
    async fn remove_taint(&self, node: &str, taint: &Taint) -> Result<()>;

    /// `None` when the workload does not exist yet.
    async fn workload_status(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadStatus>>;
    async fn wait_for_condition(
        &self,
        resource: &str,
        namespace: Option<&str>,
        condition: &str,
        timeout: Duration,
    ) -> Result<()>;

    async fn apply_manifest(&self, source: &ManifestSource) -> Result<()>;
}

/// Helm-style package operations.
#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn add_repository(&self, name: &str, url: &str) -> Result<()>;
    async fn update_repositories(&self) -> Result<()>;
    async fn install_or_upgrade(&self, release: &ReleaseSpec) -> Result<()>;
    async fn release_exists(&self, name: &str, namespace: &str) -> Result<bool>;
}

/// Cluster provisioner operations (start/stop, node access).
#[async_trait]
pub trait ClusterLifecycle: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn delete(&self) -> Result<()>;
    async fn is_running(&self) -> Result<bool>;
    async fn node_names(&self) -> Result<Vec<String>>;
    /// Control-plane address as seen from inside the cluster network.
    async fn api_endpoint(&self) -> Result<ApiEndpoint>;
    /// Run a privileged command on a node.
    async fn exec_on_node(&self, node: &str, command: &[String]) -> Result<CommandOutput>;
    async fn stop_host_service(&self, name: &str) -> Result<()>;
    async fn remove_host_service(&self, name: &str) -> Result<()>;
}

/// Lab deployment configuration
/// Loaded from labctl.toml
use crate::error::{DeployError, Result};
use crate::nodes::GpuMode;
use crate::retry::RetryPolicy;
use crate::backend::WorkloadKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "labctl.toml";

/// Well-known component keys read by the tiers.
pub mod component {
    pub const CNI: &str = "cni";
    pub const CERT_MANAGER: &str = "cert_manager";
    pub const TRUST_MANAGER: &str = "trust_manager";
    pub const GATEWAY: &str = "gateway";
    pub const IAM: &str = "iam";
    pub const OBSERVABILITY: &str = "observability";
    pub const APPLICATION: &str = "application";
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LabConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub gpu: GpuConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub prefetch: PrefetchConfig,

    #[serde(default)]
    pub pki: PkiConfig,

    /// Directory of Tera templates (manifests and values files)
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    /// Helm-installed components keyed by role
    #[serde(default)]
    pub components: BTreeMap<String, ComponentConfig>,

    /// Directory relative paths are resolved against (the config file's directory)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl LabConfig {
    /// Load configuration from `explicit`, or from the first default location
    /// that exists. Falls back to defaults when nothing is found.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let mut config_paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            config_paths.push(dir.join("labctl").join(CONFIG_FILE_NAME));
        }

        for path in config_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::warn!("No {} found, using defaults", CONFIG_FILE_NAME);
        Ok(Self {
            base_dir: PathBuf::from("."),
            ..Self::default()
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let mut config = Self::from_toml(&content).map_err(|e| match e {
            DeployError::Config(msg) => {
                DeployError::Config(format!("Failed to parse config file {:?}: {}", path, msg))
            }
            other => other,
        })?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::info!("Loaded lab config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: LabConfig =
            toml::from_str(content).map_err(|e| DeployError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.name.trim().is_empty() {
            return Err(DeployError::Config("cluster.name must not be empty".into()));
        }
        if self.cluster.servers == 0 {
            return Err(DeployError::Config("cluster.servers must be at least 1".into()));
        }
        self.gpu.mode()?;
        Ok(())
    }

    /// Resolve a path from the config against `base_dir`.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn component(&self, key: &str) -> Result<&ComponentConfig> {
        self.components.get(key).ok_or_else(|| {
            DeployError::Config(format!("component '{}' is not configured", key))
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_secs(self.retry.initial_delay_secs),
        )
        .with_max_delay(Duration::from_secs(self.retry.max_delay_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,

    #[serde(default = "default_servers")]
    pub servers: u32,

    /// Worker nodes; 0 means single-node topology
    #[serde(default)]
    pub agents: u32,

    /// Node image override (k3s image)
    #[serde(default)]
    pub image: Option<String>,

    /// Pass host GPUs through to the node containers
    #[serde(default)]
    pub gpus: bool,

    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub kube_context: Option<String>,

    #[serde(default = "default_node_timeout")]
    pub node_ready_timeout_secs: u64,

    /// Host-side containers (registry, DNS) stopped/removed with the cluster
    #[serde(default)]
    pub host_services: Vec<String>,
}

fn default_cluster_name() -> String {
    "lab".to_string()
}

fn default_servers() -> u32 {
    1
}

fn default_node_timeout() -> u64 {
    300
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            servers: default_servers(),
            agents: 0,
            image: None,
            gpus: false,
            extra_args: Vec::new(),
            kube_context: None,
            node_ready_timeout_secs: default_node_timeout(),
            host_services: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn expected_nodes(&self) -> usize {
        (self.servers + self.agents) as usize
    }

    /// kubectl context k3d writes for this cluster.
    pub fn context(&self) -> String {
        self.kube_context
            .clone()
            .unwrap_or_else(|| format!("k3d-{}", self.name))
    }
}

/// GPU mode as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuModeSetting {
    #[default]
    Disabled,
    None,
    All,
    Specific,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuConfig {
    #[serde(default)]
    pub mode: GpuModeSetting,

    /// Node name, required when mode = "specific"
    #[serde(default)]
    pub node: Option<String>,

    /// Treat every node as CPU even when a GPU mode is set
    #[serde(default)]
    pub force_cpu: bool,
}

impl GpuConfig {
    pub fn mode(&self) -> Result<GpuMode> {
        match self.mode {
            GpuModeSetting::Disabled => Ok(GpuMode::Disabled),
            GpuModeSetting::None => Ok(GpuMode::None),
            GpuModeSetting::All => Ok(GpuMode::All),
            GpuModeSetting::Specific => self
                .node
                .clone()
                .filter(|n| !n.trim().is_empty())
                .map(GpuMode::Specific)
                .ok_or_else(|| {
                    DeployError::Config("gpu.node is required when gpu.mode = \"specific\"".into())
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    3
}

fn default_max_delay() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_readiness_timeout() -> u64 {
    600
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_readiness_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Values file holding the artifact reference
    #[serde(default)]
    pub values_file: Option<PathBuf>,

    /// Dotted key of the image block inside the values file
    #[serde(default = "default_image_key")]
    pub image_key: String,

    #[serde(default = "default_prefetch_timeout")]
    pub timeout_secs: u64,
}

fn default_image_key() -> String {
    "image".to_string()
}

fn default_prefetch_timeout() -> u64 {
    1800
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            values_file: None,
            image_key: default_image_key(),
            timeout_secs: default_prefetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PkiConfig {
    /// PEM file of the local root CA, published to the cluster in tier 1
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

/// A workload to wait for after installing a component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitTarget {
    pub kind: WorkloadKind,
    pub name: String,
    /// Defaults to the component namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Helm release configuration for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub release: String,
    pub chart: String,
    #[serde(default)]
    pub version: Option<String>,
    pub namespace: String,

    #[serde(default)]
    pub repo_name: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,

    #[serde(default)]
    pub values_file: Option<PathBuf>,

    /// Extra values layered over an existing release with reuse-values
    #[serde(default)]
    pub ca_values_file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub wait: bool,

    #[serde(default = "default_release_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub create_namespace: bool,

    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub wait_for: Vec<WaitTarget>,
}

fn default_true() -> bool {
    true
}

fn default_release_timeout() -> u64 {
    600
}

impl ComponentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

//! Recording in-memory backends shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use deploy::backend::{
    ApiEndpoint, ClusterBackend, ClusterLifecycle, CommandOutput, Labels, ManifestSource,
    NodeInfo, PackageManager, ReleaseSpec, Taint, WorkloadKind, WorkloadStatus,
};
use deploy::config::LabConfig;
use deploy::error::{BackendErrorKind, DeployError, Result};
use deploy::tiers::Backends;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

/// Ordered log of every backend call, shared by all fakes of one environment.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }
}

/// Scripted failures keyed by operation name, consumed in order.
#[derive(Default)]
pub struct FailureScript(Mutex<HashMap<String, VecDeque<(BackendErrorKind, String)>>>);

impl FailureScript {
    pub fn push(&self, operation: &str, kind: BackendErrorKind, times: usize) {
        let mut script = self.0.lock().unwrap();
        let queue = script.entry(operation.to_string()).or_default();
        for _ in 0..times {
            queue.push_back((kind, format!("scripted {:?} failure", kind)));
        }
    }

    fn take(&self, operation: &str) -> Result<()> {
        let next = self
            .0
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match next {
            Some((kind, message)) => Err(DeployError::backend(kind, operation, message)),
            None => Ok(()),
        }
    }
}

pub fn control_plane(name: &str) -> NodeInfo {
    NodeInfo::new(name)
        .with_label(CONTROL_PLANE, "true")
        .with_taint(CONTROL_PLANE, "NoSchedule")
}

pub fn worker(name: &str) -> NodeInfo {
    NodeInfo::new(name)
}

fn labels_to_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct FakeCluster {
    log: CallLog,
    pub failures: FailureScript,
    nodes: Mutex<Vec<NodeInfo>>,
    namespaces: Mutex<BTreeMap<String, Labels>>,
    secrets: Mutex<BTreeMap<(String, String), Labels>>,
    workloads: Mutex<HashMap<String, Option<WorkloadStatus>>>,
    manifests: Mutex<Vec<ManifestSource>>,
    status_delay: Mutex<Duration>,
}

impl FakeCluster {
    pub fn new(log: CallLog, nodes: Vec<NodeInfo>) -> Self {
        Self {
            log,
            failures: FailureScript::default(),
            nodes: Mutex::new(nodes),
            namespaces: Mutex::new(BTreeMap::new()),
            secrets: Mutex::new(BTreeMap::new()),
            workloads: Mutex::new(HashMap::new()),
            manifests: Mutex::new(Vec::new()),
            status_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every `workload_status` call hang for `delay` first.
    pub fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = delay;
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.lock().unwrap().clone()
    }

    pub fn node(&self, name: &str) -> NodeInfo {
        self.nodes()
            .into_iter()
            .find(|n| n.name == name)
            .unwrap_or_else(|| panic!("no node {}", name))
    }

    pub fn namespace_labels(&self, name: &str) -> Option<Labels> {
        self.namespaces.lock().unwrap().get(name).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Labels> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, data: Labels) {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    /// Override the reported status; unknown workloads report 1/1 ready.
    pub fn set_workload(&self, kind: WorkloadKind, namespace: &str, name: &str, status: Option<WorkloadStatus>) {
        self.workloads
            .lock()
            .unwrap()
            .insert(format!("{}/{}/{}", kind, namespace, name), status);
    }

    pub fn manifests(&self) -> Vec<ManifestSource> {
        self.manifests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterBackend for FakeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.namespaces.lock().unwrap().contains_key(name))
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        self.failures.take("create_namespace")?;
        let mut namespaces = self.namespaces.lock().unwrap();
        if namespaces.contains_key(name) {
            return Err(DeployError::backend(
                BackendErrorKind::AlreadyExists,
                "create_namespace",
                format!("namespaces \"{}\" already exists", name),
            ));
        }
        namespaces.insert(name.to_string(), Labels::new());
        self.log.push(format!("create_namespace {}", name));
        Ok(())
    }

    async fn label_namespace(&self, name: &str, labels: &Labels) -> Result<()> {
        let mut namespaces = self.namespaces.lock().unwrap();
        let existing = namespaces.entry(name.to_string()).or_default();
        for (k, v) in labels {
            existing.insert(k.clone(), v.clone());
        }
        self.log
            .push(format!("label_namespace {} {}", name, labels_to_string(labels)));
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Labels>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, name: &str, data: &Labels) -> Result<()> {
        self.failures.take("create_secret")?;
        self.insert_secret(namespace, name, data.clone());
        self.log.push(format!("create_secret {}/{}", namespace, name));
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        self.log.push(format!("delete_secret {}/{}", namespace, name));
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.failures.take("list_nodes")?;
        Ok(self.nodes())
    }

    async fn label_node(&self, node: &str, labels: &Labels) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let target = nodes
            .iter_mut()
            .find(|n| n.name == node)
            .ok_or_else(|| DeployError::backend(BackendErrorKind::NotFound, "label_node", node))?;
        for (k, v) in labels {
            target.labels.insert(k.clone(), v.clone());
        }
        self.log
            .push(format!("label_node {} {}", node, labels_to_string(labels)));
        Ok(())
    }

    async fn remove_node_label(&self, node: &str, key: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(target) = nodes.iter_mut().find(|n| n.name == node) {
            target.labels.remove(key);
        }
        self.log.push(format!("remove_node_label {} {}", node, key));
        Ok(())
    }

    async fn remove_taint(&self, node: &str, taint: &Taint) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(target) = nodes.iter_mut().find(|n| n.name == node) {
            target.taints.retain(|t| t.key != taint.key);
        }
        self.log.push(format!("remove_taint {} {}", node, taint.key));
        Ok(())
    }

    async fn workload_status(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadStatus>> {
        let key = format!("{}/{}/{}", kind, namespace, name);
        self.log.push(format!("workload_status {}", key));
        let delay = *self.status_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Some(WorkloadStatus {
                desired: 1,
                ready: 1,
            })))
    }

    async fn wait_for_condition(
        &self,
        resource: &str,
        namespace: Option<&str>,
        condition: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.failures.take("wait_for_condition")?;
        self.log.push(format!(
            "wait_for_condition {} {} {}",
            namespace.unwrap_or("-"),
            resource,
            condition
        ));
        Ok(())
    }

    async fn apply_manifest(&self, source: &ManifestSource) -> Result<()> {
        self.failures.take("apply_manifest")?;
        self.manifests.lock().unwrap().push(source.clone());
        self.log.push(format!("apply_manifest {}", source.describe()));
        Ok(())
    }
}

pub struct FakePackages {
    log: CallLog,
    pub failures: FailureScript,
    releases: Mutex<Vec<ReleaseSpec>>,
}

impl FakePackages {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            failures: FailureScript::default(),
            releases: Mutex::new(Vec::new()),
        }
    }

    /// Every install/upgrade call, in order.
    pub fn releases(&self) -> Vec<ReleaseSpec> {
        self.releases.lock().unwrap().clone()
    }

    pub fn release(&self, name: &str) -> Option<ReleaseSpec> {
        self.releases().into_iter().rev().find(|r| r.name == name)
    }
}

#[async_trait]
impl PackageManager for FakePackages {
    async fn add_repository(&self, name: &str, url: &str) -> Result<()> {
        self.log.push(format!("add_repository {} {}", name, url));
        Ok(())
    }

    async fn update_repositories(&self) -> Result<()> {
        self.log.push("update_repositories");
        Ok(())
    }

    async fn install_or_upgrade(&self, release: &ReleaseSpec) -> Result<()> {
        self.log
            .push(format!("install {}/{}", release.namespace, release.name));
        self.failures.take(&format!("install {}", release.name))?;
        self.releases.lock().unwrap().push(release.clone());
        Ok(())
    }

    async fn release_exists(&self, name: &str, namespace: &str) -> Result<bool> {
        Ok(self
            .releases()
            .iter()
            .any(|r| r.name == name && r.namespace == namespace))
    }
}

pub struct FakeLifecycle {
    log: CallLog,
    pub failures: FailureScript,
    running: Mutex<bool>,
    node_names: Vec<String>,
    exec_delay: Mutex<Duration>,
}

impl FakeLifecycle {
    pub fn new(log: CallLog, node_names: Vec<String>) -> Self {
        Self {
            log,
            failures: FailureScript::default(),
            running: Mutex::new(false),
            node_names,
            exec_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every `exec_on_node` take `delay`.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = delay;
    }

    pub fn is_up(&self) -> bool {
        *self.running.lock().unwrap()
    }
}

#[async_trait]
impl ClusterLifecycle for FakeLifecycle {
    async fn start(&self) -> Result<()> {
        self.failures.take("start")?;
        *self.running.lock().unwrap() = true;
        self.log.push("start");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.running.lock().unwrap() = false;
        self.log.push("stop");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.running.lock().unwrap() = false;
        self.log.push("delete");
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.is_up())
    }

    async fn node_names(&self) -> Result<Vec<String>> {
        Ok(self.node_names.clone())
    }

    async fn api_endpoint(&self) -> Result<ApiEndpoint> {
        Ok(ApiEndpoint {
            host: "172.18.0.2".to_string(),
            port: 6443,
        })
    }

    async fn exec_on_node(&self, node: &str, command: &[String]) -> Result<CommandOutput> {
        let delay = *self.exec_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.failures.take("exec_on_node")?;
        self.log.push(format!("exec {} {}", node, command.join(" ")));
        Ok(CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn stop_host_service(&self, name: &str) -> Result<()> {
        self.failures.take("stop_host_service")?;
        self.log.push(format!("stop_host_service {}", name));
        Ok(())
    }

    async fn remove_host_service(&self, name: &str) -> Result<()> {
        self.failures.take("remove_host_service")?;
        self.log.push(format!("remove_host_service {}", name));
        Ok(())
    }
}

/// One fake cluster environment sharing a single call log.
pub struct FakeEnv {
    pub log: CallLog,
    pub cluster: Arc<FakeCluster>,
    pub packages: Arc<FakePackages>,
    pub lifecycle: Arc<FakeLifecycle>,
}

impl FakeEnv {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        let log = CallLog::default();
        let names = nodes.iter().map(|n| n.name.clone()).collect();
        Self {
            cluster: Arc::new(FakeCluster::new(log.clone(), nodes)),
            packages: Arc::new(FakePackages::new(log.clone())),
            lifecycle: Arc::new(FakeLifecycle::new(log.clone(), names)),
            log,
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            cluster: self.cluster.clone(),
            packages: self.packages.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

/// Config with every component present and short timeouts.
pub const LAB_TOML: &str = r#"
[cluster]
name = "test"
servers = 1
agents = 2
node_ready_timeout_secs = 30
host_services = ["lab-registry", "lab-dns"]

[gpu]
mode = "all"

[retry]
max_retries = 2
initial_delay_secs = 1

[readiness]
poll_interval_secs = 1
timeout_secs = 10

[components.cni]
release = "cilium"
chart = "cilium/cilium"
namespace = "kube-system"
repo_name = "cilium"
repo_url = "https://helm.cilium.io"
wait_for = [{ kind = "daemonset", name = "cilium" }]

[components.cert_manager]
release = "cert-manager"
chart = "jetstack/cert-manager"
namespace = "cert-manager"

[components.trust_manager]
release = "trust-manager"
chart = "jetstack/trust-manager"
namespace = "cert-manager"

[components.gateway]
release = "envoy-gateway"
chart = "oci://docker.io/envoyproxy/gateway-helm"
namespace = "envoy-gateway-system"

[components.iam]
release = "keycloak"
chart = "bitnami/keycloak"
namespace = "iam"
namespace_labels = { "lab.local/tier" = "platform" }
wait_for = [{ kind = "statefulset", name = "keycloak" }]

[components.observability]
release = "monitoring"
chart = "prometheus-community/kube-prometheus-stack"
namespace = "monitoring"

[components.application]
release = "inference"
chart = "lab/inference"
namespace = "apps"
wait_for = [{ kind = "deployment", name = "inference" }]
"#;

pub fn lab_config() -> LabConfig {
    LabConfig::from_toml(LAB_TOML).expect("test config parses")
}

/// Two workers and one control-plane node, in API order.
pub fn multi_node() -> Vec<NodeInfo> {
    vec![control_plane("cp"), worker("w1"), worker("w2")]
}

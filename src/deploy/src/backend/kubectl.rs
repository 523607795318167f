/// ClusterBackend implemented by shelling out to kubectl.
use super::command::{args, CommandRunner};
use super::{
    ClusterBackend, Labels, ManifestSource, NodeInfo, Taint, WorkloadKind, WorkloadStatus,
};
use crate::error::{BackendErrorKind, DeployError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Prints `key=value` lines with decoded secret data.
const SECRET_DATA_TEMPLATE: &str =
    r#"{{range $k, $v := .data}}{{$k}}={{$v | base64decode}}{{"\n"}}{{end}}"#;

pub struct KubectlBackend {
    runner: CommandRunner,
}

impl KubectlBackend {
    pub fn new(context: Option<&str>) -> Self {
        let base_args = context
            .map(|c| vec!["--context".to_string(), c.to_string()])
            .unwrap_or_default();
        Self {
            runner: CommandRunner::new("kubectl").with_base_args(base_args),
        }
    }

    async fn get_json(&self, operation: &str, argv: Vec<String>) -> Result<Option<Value>> {
        match self.runner.run(operation, &argv, None).await {
            Ok(output) => Ok(Some(serde_json::from_str(&output.stdout)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn label_args(labels: &Labels) -> Vec<String> {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn parse_node(item: &Value) -> Option<NodeInfo> {
    let name = item.pointer("/metadata/name")?.as_str()?.to_string();
    let labels = item
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let taints = item
        .pointer("/spec/taints")
        .and_then(|t| serde_json::from_value::<Vec<Taint>>(t.clone()).ok())
        .unwrap_or_default();
    Some(NodeInfo {
        name,
        labels,
        taints,
    })
}

fn parse_workload_status(kind: WorkloadKind, doc: &Value) -> WorkloadStatus {
    let int = |pointer: &str| doc.pointer(pointer).and_then(Value::as_i64);
    match kind {
        WorkloadKind::DaemonSet => WorkloadStatus {
            desired: int("/status/desiredNumberScheduled").unwrap_or(0),
            ready: int("/status/numberReady").unwrap_or(0),
        },
        WorkloadKind::Deployment | WorkloadKind::StatefulSet => WorkloadStatus {
            desired: int("/spec/replicas").unwrap_or(1),
            ready: int("/status/readyReplicas").unwrap_or(0),
        },
    }
}

#[async_trait]
impl ClusterBackend for KubectlBackend {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let found = self
            .get_json(
                "get namespace",
                args(["get", "namespace", name, "-o", "json"]),
            )
            .await?;
        Ok(found.is_some())
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        self.runner
            .run("create namespace", &args(["create", "namespace", name]), None)
            .await?;
        Ok(())
    }

    async fn label_namespace(&self, name: &str, labels: &Labels) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let mut argv = args(["label", "namespace", name, "--overwrite"]);
        argv.extend(label_args(labels));
        self.runner.run("label namespace", &argv, None).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Labels>> {
        let argv = args([
            "get",
            "secret",
            name,
            "-n",
            namespace,
            "-o",
            &format!("go-template={}", SECRET_DATA_TEMPLATE),
        ]);
        match self.runner.run("get secret", &argv, None).await {
            Ok(output) => Ok(Some(
                output
                    .stdout
                    .lines()
                    .filter_map(|line| line.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_secret(&self, namespace: &str, name: &str, data: &Labels) -> Result<()> {
        let mut argv = args(["create", "secret", "generic", name, "-n", namespace]);
        argv.extend(data.iter().map(|(k, v)| format!("--from-literal={}={}", k, v)));
        self.runner.run("create secret", &argv, None).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let argv = args([
            "delete",
            "secret",
            name,
            "-n",
            namespace,
            "--ignore-not-found=true",
        ]);
        self.runner.run("delete secret", &argv, None).await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let output = self
            .runner
            .run("list nodes", &args(["get", "nodes", "-o", "json"]), None)
            .await?;
        let doc: Value = serde_json::from_str(&output.stdout)?;
        let items = doc
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                DeployError::backend(
                    BackendErrorKind::Other,
                    "list nodes",
                    "response has no items array",
                )
            })?;
        Ok(items.iter().filter_map(parse_node).collect())
    }

    async fn label_node(&self, node: &str, labels: &Labels) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let mut argv = args(["label", "node", node, "--overwrite"]);
        argv.extend(label_args(labels));
        self.runner.run("label node", &argv, None).await?;
        Ok(())
    }

    async fn remove_node_label(&self, node: &str, key: &str) -> Result<()> {
        let spec = format!("{}-", key);
        self.runner
            .run("remove node label", &args(["label", "node", node, &spec]), None)
            .await?;
        Ok(())
    }

    async fn remove_taint(&self, node: &str, taint: &Taint) -> Result<()> {
        let spec = format!("{}:{}-", taint.key, taint.effect);
        match self
            .runner
            .run("remove taint", &args(["taint", "node", node, &spec]), None)
            .await
        {
            Err(e) if e.is_not_found() => {
                tracing::debug!("[Kubectl] Taint {} already absent on {}", taint.key, node);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn workload_status(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadStatus>> {
        let doc = self
            .get_json(
                "get workload",
                args(["get", kind.as_str(), name, "-n", namespace, "-o", "json"]),
            )
            .await?;
        Ok(doc.map(|d| parse_workload_status(kind, &d)))
    }

    async fn wait_for_condition(
        &self,
        resource: &str,
        namespace: Option<&str>,
        condition: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut argv = args([
            "wait".to_string(),
            format!("--for=condition={}", condition),
            format!("--timeout={}s", timeout.as_secs()),
            resource.to_string(),
        ]);
        if let Some(ns) = namespace {
            argv.extend(args(["-n", ns]));
        }
        self.runner.run("wait for condition", &argv, None).await?;
        Ok(())
    }

    async fn apply_manifest(&self, source: &ManifestSource) -> Result<()> {
        match source {
            ManifestSource::Path(path) => {
                let path = path.to_string_lossy();
                self.runner
                    .run("apply manifest", &args(["apply", "-f", &path]), None)
                    .await?;
            }
            ManifestSource::Url(url) => {
                self.runner
                    .run("apply manifest", &args(["apply", "-f", url]), None)
                    .await?;
            }
            ManifestSource::Content(content) => {
                self.runner
                    .run("apply manifest", &args(["apply", "-f", "-"]), Some(content))
                    .await?;
            }
        }
        Ok(())
    }
}

/// ClusterLifecycle backed by k3d, with node access through docker.
use super::command::{args, CommandRunner};
use super::{ApiEndpoint, ClusterLifecycle, CommandOutput};
use crate::config::ClusterConfig;
use crate::error::{BackendErrorKind, DeployError, Result};
use async_trait::async_trait;
use serde_json::Value;

/// API server port inside the cluster network.
const INTERNAL_API_PORT: u16 = 6443;

pub struct K3dLifecycle {
    cluster: ClusterConfig,
    k3d: CommandRunner,
    docker: CommandRunner,
}

impl K3dLifecycle {
    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            k3d: CommandRunner::new("k3d"),
            docker: CommandRunner::new("docker"),
        }
    }

    fn server_node(&self) -> String {
        format!("k3d-{}-server-0", self.cluster.name)
    }

    /// `k3d cluster create` arguments. Flannel and the bundled network policy
    /// controller are disabled because the CNI is installed in tier 0.
    pub fn create_args(&self) -> Vec<String> {
        let mut argv = args([
            "cluster".to_string(),
            "create".to_string(),
            self.cluster.name.clone(),
            format!("--servers={}", self.cluster.servers),
            format!("--agents={}", self.cluster.agents),
            "--k3s-arg=--flannel-backend=none@server:*".to_string(),
            "--k3s-arg=--disable-network-policy@server:*".to_string(),
            "--wait".to_string(),
        ]);
        if let Some(image) = &self.cluster.image {
            argv.push(format!("--image={}", image));
        }
        if self.cluster.gpus {
            argv.push("--gpus=all".to_string());
        }
        argv.extend(self.cluster.extra_args.iter().cloned());
        argv
    }

    async fn cluster_json(&self) -> Result<Option<Value>> {
        let output = self
            .k3d
            .run(
                "k3d cluster list",
                &args(["cluster", "list", "-o", "json"]),
                None,
            )
            .await?;
        let clusters: Vec<Value> = serde_json::from_str(&output.stdout)?;
        Ok(clusters
            .into_iter()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(self.cluster.name.as_str())))
    }
}

#[async_trait]
impl ClusterLifecycle for K3dLifecycle {
    async fn start(&self) -> Result<()> {
        if self.cluster_json().await?.is_some() {
            tracing::info!("[K3d] Starting existing cluster {}", self.cluster.name);
            self.k3d
                .run(
                    "k3d cluster start",
                    &args(["cluster", "start", &self.cluster.name, "--wait"]),
                    None,
                )
                .await?;
        } else {
            tracing::info!(
                "[K3d] Creating cluster {} ({} servers, {} agents)",
                self.cluster.name,
                self.cluster.servers,
                self.cluster.agents
            );
            self.k3d
                .run("k3d cluster create", &self.create_args(), None)
                .await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.k3d
            .run(
                "k3d cluster stop",
                &args(["cluster", "stop", &self.cluster.name]),
                None,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.k3d
            .run(
                "k3d cluster delete",
                &args(["cluster", "delete", &self.cluster.name]),
                None,
            )
            .await?;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        let running = self
            .cluster_json()
            .await?
            .and_then(|c| c.get("serversRunning").and_then(Value::as_i64))
            .unwrap_or(0);
        Ok(running > 0)
    }

    async fn node_names(&self) -> Result<Vec<String>> {
        let filter = format!("label=k3d.cluster={}", self.cluster.name);
        let output = self
            .docker
            .run(
                "list cluster nodes",
                &args([
                    "ps",
                    "--filter",
                    &filter,
                    "--filter",
                    "label=k3d.role",
                    "--format",
                    "{{.Names}} {{.Label \"k3d.role\"}}",
                ]),
                None,
            )
            .await?;
        let mut names: Vec<String> = output
            .stdout
            .lines()
            .filter_map(|line| line.split_once(' '))
            .filter(|(_, role)| matches!(*role, "server" | "agent"))
            .map(|(name, _)| name.to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn api_endpoint(&self) -> Result<ApiEndpoint> {
        let node = self.server_node();
        let output = self
            .docker
            .run(
                "inspect server node",
                &args([
                    "inspect",
                    "-f",
                    "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                    &node,
                ]),
                None,
            )
            .await?;
        let host = output
            .stdout
            .split_whitespace()
            .next()
            .ok_or_else(|| {
                DeployError::backend(
                    BackendErrorKind::NotFound,
                    "inspect server node",
                    format!("{} has no network address", node),
                )
            })?
            .to_string();
        Ok(ApiEndpoint {
            host,
            port: INTERNAL_API_PORT,
        })
    }

    async fn exec_on_node(&self, node: &str, command: &[String]) -> Result<CommandOutput> {
        let mut argv = args(["exec", node]);
        argv.extend(command.iter().cloned());
        self.docker
            .run(&format!("exec on {}", node), &argv, None)
            .await
    }

    async fn stop_host_service(&self, name: &str) -> Result<()> {
        self.docker
            .run("stop host service", &args(["stop", name]), None)
            .await?;
        Ok(())
    }

    async fn remove_host_service(&self, name: &str) -> Result<()> {
        self.docker
            .run("remove host service", &args(["rm", "-f", name]), None)
            .await?;
        Ok(())
    }
}

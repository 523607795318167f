//! Tier 0: cluster, CNI and node roles.
use super::TierContext;
use crate::config::component;
use crate::error::Result;
use crate::nodes::{apply_plan, elect_workload_node, plan_assignments};
use crate::steps::StepRunner;
use serde_json::json;
use serde_yaml::Mapping;
use std::time::Duration;

pub const STEPS: &[&str] = &[
    "Start cluster",
    "Wait for nodes",
    "Mount BPF filesystem",
    "Install CNI",
    "Wait for CNI",
    "Label nodes",
    "Elect workload node",
];

/// Makes /sys/fs/bpf a shared bpffs mount; a no-op when already mounted.
const BPF_MOUNT_SCRIPT: &str =
    "mountpoint -q /sys/fs/bpf || mount bpffs /sys/fs/bpf -t bpf; mount --make-shared /sys/fs/bpf";

/// Returns the elected workload node, if any.
pub async fn run(ctx: &TierContext, runner: &mut StepRunner) -> Result<Option<String>> {
    let cluster = &ctx.config.cluster;

    runner
        .run_step("Start cluster", || async move {
            if ctx.lifecycle.is_running().await? {
                tracing::info!("[ClusterBase] Cluster {} already running", cluster.name);
                return Ok(());
            }
            ctx.lifecycle.start().await
        })
        .await?;

    runner
        .run_step("Wait for nodes", || async move {
            ctx.applier
                .wait_for_nodes(
                    cluster.expected_nodes(),
                    Duration::from_secs(cluster.node_ready_timeout_secs),
                )
                .await
                .map(|_| ())
        })
        .await?;

    runner
        .run_step("Mount BPF filesystem", || async move {
            let command: Vec<String> = ["sh", "-c", BPF_MOUNT_SCRIPT]
                .iter()
                .map(|s| s.to_string())
                .collect();
            for node in ctx.lifecycle.node_names().await? {
                ctx.lifecycle.exec_on_node(&node, &command).await?;
                tracing::debug!("[ClusterBase] bpffs mounted on {}", node);
            }
            Ok(())
        })
        .await?;

    runner
        .run_step("Install CNI", || async move {
            let endpoint = ctx.lifecycle.api_endpoint().await?;
            let data = json!({
                "cluster_name": cluster.name,
                "api_host": endpoint.host,
                "api_port": endpoint.port,
                "node_count": cluster.expected_nodes(),
            });
            ctx.install_component_reusing_values(component::CNI, Some(data), Mapping::new())
                .await
        })
        .await?;

    runner
        .run_step("Wait for CNI", || ctx.wait_for_component(component::CNI))
        .await?;

    runner
        .run_step("Label nodes", || async move {
            let nodes = ctx.cluster.list_nodes().await?;
            let mode = ctx.config.gpu.mode()?;
            let plan = plan_assignments(&nodes, &mode, ctx.config.gpu.force_cpu)?;
            apply_plan(ctx.cluster.as_ref(), &plan).await
        })
        .await?;

    runner
        .run_step("Elect workload node", || async move {
            Ok(elect_workload_node(ctx.cluster.as_ref()).await)
        })
        .await
}

//! Node classification, GPU/CPU role assignment and workload-node election.
//!
//! Planning is pure and order-sensitive over the node list as returned by the
//! cluster. [`apply_plan`] writes the plan back as labels (and taint removal
//! for single-node GPU clusters); [`elect_workload_node`] then reads the final
//! labels back, so every consumer sees one authoritative election.

use crate::backend::{ClusterBackend, Labels, NodeInfo, Taint};
use crate::error::{DeployError, Result};

pub const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Accelerator assigned by this pipeline (`nvidia` or `cpu`).
pub const ACCELERATOR_LABEL: &str = "lab.local/accelerator";

/// Gates scheduling of GPU operator daemons on a node.
pub const GPU_OPERANDS_LABEL: &str = "nvidia.com/gpu.deploy.operands";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

pub fn node_role(node: &NodeInfo) -> NodeRole {
    if CONTROL_PLANE_LABELS
        .iter()
        .any(|label| node.labels.contains_key(*label))
    {
        NodeRole::ControlPlane
    } else {
        NodeRole::Worker
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    SingleNode,
    MultiNode,
}

/// Configured GPU intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuMode {
    Disabled,
    None,
    /// Elect one GPU node automatically.
    All,
    /// Use the named node as the GPU node.
    Specific(String),
}

impl GpuMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, GpuMode::All | GpuMode::Specific(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuAssignment {
    GpuNvidia,
    Cpu,
    /// Not a workload node; no accelerator label.
    Disabled,
}

impl GpuAssignment {
    pub fn label_value(&self) -> Option<&'static str> {
        match self {
            GpuAssignment::GpuNvidia => Some("nvidia"),
            GpuAssignment::Cpu => Some("cpu"),
            GpuAssignment::Disabled => None,
        }
    }
}

/// Nodes split by role, cluster order preserved within each group.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedNodes {
    pub control_plane: Vec<NodeInfo>,
    pub workers: Vec<NodeInfo>,
}

impl ClassifiedNodes {
    pub fn classify(nodes: &[NodeInfo]) -> Self {
        let (control_plane, workers): (Vec<NodeInfo>, Vec<NodeInfo>) = nodes
            .iter()
            .cloned()
            .partition(|n| node_role(n) == NodeRole::ControlPlane);
        Self {
            control_plane,
            workers,
        }
    }

    pub fn topology(&self) -> Topology {
        if self.workers.is_empty() {
            Topology::SingleNode
        } else {
            Topology::MultiNode
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAssignment {
    pub node: String,
    pub role: NodeRole,
    pub assignment: GpuAssignment,
    pub remove_taints: Vec<Taint>,
}

/// Result of planning; applying it is a separate, idempotent step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub topology: Topology,
    pub gpu_enabled: bool,
    pub assignments: Vec<NodeAssignment>,
}

impl NodePlan {
    pub fn gpu_node(&self) -> Option<&str> {
        self.assignments
            .iter()
            .find(|a| a.assignment == GpuAssignment::GpuNvidia)
            .map(|a| a.node.as_str())
    }

    pub fn assignment_for(&self, node: &str) -> Option<GpuAssignment> {
        self.assignments
            .iter()
            .find(|a| a.node == node)
            .map(|a| a.assignment)
    }
}

fn control_plane_taints(node: &NodeInfo) -> Vec<Taint> {
    node.taints
        .iter()
        .filter(|t| CONTROL_PLANE_LABELS.contains(&t.key.as_str()))
        .cloned()
        .collect()
}

/// Assign a role to every node.
///
/// GPU mode marks exactly one node `GpuNvidia`; `force_cpu` downgrades any
/// GPU mode to CPU-only.
pub fn plan_assignments(nodes: &[NodeInfo], mode: &GpuMode, force_cpu: bool) -> Result<NodePlan> {
    let classified = ClassifiedNodes::classify(nodes);
    let topology = classified.topology();
    let gpu_enabled = mode.is_enabled() && !force_cpu;

    if force_cpu && mode.is_enabled() {
        tracing::info!("[NodeClassifier] CPU mode forced, ignoring GPU mode {:?}", mode);
    }

    let assignments = match topology {
        Topology::SingleNode => {
            let first = classified
                .control_plane
                .first()
                .ok_or(DeployError::NoControlPlane)?;
            if let GpuMode::Specific(name) = mode {
                if gpu_enabled && name != &first.name {
                    return Err(DeployError::NodeNotFound(name.clone()));
                }
            }
            classified
                .control_plane
                .iter()
                .enumerate()
                .map(|(index, node)| {
                    let is_gpu = gpu_enabled && index == 0;
                    NodeAssignment {
                        node: node.name.clone(),
                        role: NodeRole::ControlPlane,
                        assignment: if is_gpu {
                            GpuAssignment::GpuNvidia
                        } else {
                            GpuAssignment::Cpu
                        },
                        remove_taints: if is_gpu {
                            control_plane_taints(node)
                        } else {
                            Vec::new()
                        },
                    }
                })
                .collect()
        }
        Topology::MultiNode => {
            let gpu_node = match mode {
                _ if !gpu_enabled => None,
                GpuMode::Specific(name) => {
                    if !nodes.iter().any(|n| &n.name == name) {
                        return Err(DeployError::NodeNotFound(name.clone()));
                    }
                    Some(name.clone())
                }
                _ => classified.workers.first().map(|w| w.name.clone()),
            };

            nodes
                .iter()
                .map(|node| {
                    let role = node_role(node);
                    let assignment = if gpu_node.as_deref() == Some(node.name.as_str()) {
                        GpuAssignment::GpuNvidia
                    } else if role == NodeRole::Worker {
                        GpuAssignment::Cpu
                    } else {
                        GpuAssignment::Disabled
                    };
                    NodeAssignment {
                        node: node.name.clone(),
                        role,
                        assignment,
                        remove_taints: Vec::new(),
                    }
                })
                .collect()
        }
    };

    let plan = NodePlan {
        topology,
        gpu_enabled,
        assignments,
    };
    tracing::info!(
        "[NodeClassifier] {:?} topology, {} control-plane, {} workers, GPU node: {}",
        plan.topology,
        classified.control_plane.len(),
        classified.workers.len(),
        plan.gpu_node().unwrap_or("none")
    );
    Ok(plan)
}

fn single_label(key: &str, value: &str) -> Labels {
    Labels::from([(key.to_string(), value.to_string())])
}

/// Write the plan to the cluster.
///
/// Operand scheduling is switched off on every node before it is switched back
/// on for the GPU node, so operator daemons never land on CPU nodes in between.
/// Labels left over from an earlier plan are overwritten or removed, which keeps
/// at most one node labelled `nvidia` across re-runs with a different GPU mode.
pub async fn apply_plan(cluster: &dyn ClusterBackend, plan: &NodePlan) -> Result<()> {
    let disable = single_label(GPU_OPERANDS_LABEL, "false");
    for assignment in &plan.assignments {
        cluster.label_node(&assignment.node, &disable).await?;
    }

    for assignment in &plan.assignments {
        match assignment.assignment.label_value() {
            Some(value) => {
                cluster
                    .label_node(&assignment.node, &single_label(ACCELERATOR_LABEL, value))
                    .await?;
                tracing::info!("[NodeClassifier] {} -> {}", assignment.node, value);
            }
            None => {
                cluster
                    .remove_node_label(&assignment.node, ACCELERATOR_LABEL)
                    .await?;
                tracing::debug!("[NodeClassifier] {} carries no accelerator", assignment.node);
            }
        }
        for taint in &assignment.remove_taints {
            cluster.remove_taint(&assignment.node, taint).await?;
            tracing::info!(
                "[NodeClassifier] Removed taint {}:{} from {}",
                taint.key,
                taint.effect,
                assignment.node
            );
        }
    }

    if let Some(gpu_node) = plan.gpu_node() {
        cluster
            .label_node(gpu_node, &single_label(GPU_OPERANDS_LABEL, "true"))
            .await?;
        tracing::info!("[NodeClassifier] GPU operands enabled on {}", gpu_node);
    }

    Ok(())
}

/// Pick the heavyweight-workload node from final labels: the GPU node, else the
/// first CPU worker, else the sole control-plane node.
pub fn elect_from_labels(nodes: &[NodeInfo]) -> Option<String> {
    let accelerator = |node: &&NodeInfo, value: &str| node.label(ACCELERATOR_LABEL) == Some(value);

    nodes
        .iter()
        .find(|n| accelerator(n, "nvidia"))
        .or_else(|| {
            nodes
                .iter()
                .find(|n| node_role(n) == NodeRole::Worker && accelerator(n, "cpu"))
        })
        .or_else(|| {
            let classified = ClassifiedNodes::classify(nodes);
            if classified.workers.is_empty() {
                nodes.iter().find(|n| node_role(n) == NodeRole::ControlPlane)
            } else {
                None
            }
        })
        .map(|n| n.name.clone())
}

/// Elect the workload node. Failure is logged and yields `None`.
pub async fn elect_workload_node(cluster: &dyn ClusterBackend) -> Option<String> {
    match cluster.list_nodes().await {
        Ok(nodes) => {
            let elected = elect_from_labels(&nodes);
            match &elected {
                Some(node) => tracing::info!("[NodeElector] Elected workload node {}", node),
                None => tracing::warn!("[NodeElector] No eligible workload node found"),
            }
            elected
        }
        Err(e) => {
            tracing::warn!("[NodeElector] Election failed, continuing without one: {}", e);
            None
        }
    }
}

use crate::backend::ClusterLifecycle;
use crate::error::{DeployError, Result};
use serde_yaml::Value as YamlValue;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Image pull command run on the target node.
const PULL_COMMAND: [&str; 2] = ["crictl", "pull"];

/// What to pre-pull and where.
#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub node: String,
    pub values_file: PathBuf,
    /// Dotted path to the image block, e.g. `image` or `model.image`
    pub image_key: String,
    /// Absolute bound, independent of the calling tier's timeouts
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchOutcome {
    Completed { node: String, artifact: String },
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Handle on a running prefetch. Dropping it does not stop the task.
pub struct PrefetchHandle {
    receiver: oneshot::Receiver<PrefetchOutcome>,
    task: JoinHandle<()>,
}

impl PrefetchHandle {
    /// Outcome if the task has already reported, without waiting.
    pub fn try_outcome(&mut self) -> Option<PrefetchOutcome> {
        self.receiver.try_recv().ok()
    }

    pub async fn wait(self) -> PrefetchOutcome {
        self.receiver.await.unwrap_or_else(|_| {
            PrefetchOutcome::Failed("prefetch task ended without reporting".to_string())
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl std::fmt::Debug for PrefetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchHandle")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Resolve `registry/repository:tag` from the block at `key`.
///
/// The block may be a plain string reference or a mapping with `repository`,
/// optional `registry` and optional `tag` (defaults to `latest`).
pub fn resolve_artifact(values: &YamlValue, key: &str) -> Result<String> {
    let mut node = values;
    for part in key.split('.').filter(|p| !p.is_empty()) {
        node = node
            .get(part)
            .ok_or_else(|| DeployError::Config(format!("values have no '{}' key", key)))?;
    }

    if let Some(reference) = node.as_str() {
        return Ok(reference.to_string());
    }

    let field = |name: &str| -> Option<String> {
        node.get(name).and_then(|v| match v {
            YamlValue::String(s) if !s.is_empty() => Some(s.clone()),
            YamlValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let repository = field("repository")
        .ok_or_else(|| DeployError::Config(format!("'{}' has no repository", key)))?;
    let tag = field("tag").unwrap_or_else(|| "latest".to_string());
    Ok(match field("registry") {
        Some(registry) => format!("{}/{}:{}", registry, repository, tag),
        None => format!("{}:{}", repository, tag),
    })
}

async fn run_prefetch(request: &PrefetchRequest, lifecycle: &dyn ClusterLifecycle) -> Result<String> {
    let content = tokio::fs::read_to_string(&request.values_file).await?;
    let values: YamlValue = serde_yaml::from_str(&content)?;
    let artifact = resolve_artifact(&values, &request.image_key)?;

    info!("[Prefetch] Pulling {} on {}", artifact, request.node);
    let mut command: Vec<String> = PULL_COMMAND.iter().map(|s| s.to_string()).collect();
    command.push(artifact.clone());
    let output = lifecycle.exec_on_node(&request.node, &command).await?;
    debug!("[Prefetch] {}", output.stdout.trim());
    Ok(artifact)
}

/// Launch the prefetch in the background.
///
/// The task holds only owned inputs. It stops on its own timeout or when
/// `parent` is cancelled, and reports exactly once on the handle's channel.
pub fn spawn_prefetch(
    request: PrefetchRequest,
    lifecycle: Arc<dyn ClusterLifecycle>,
    parent: &CancellationToken,
) -> PrefetchHandle {
    let (sender, receiver) = oneshot::channel();
    let cancel = parent.child_token();

    let task = tokio::spawn(async move {
        let prefetch_start = std::time::Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => PrefetchOutcome::Cancelled,
            result = tokio::time::timeout(request.timeout, run_prefetch(&request, lifecycle.as_ref())) => {
                match result {
                    Ok(Ok(artifact)) => PrefetchOutcome::Completed {
                        node: request.node.clone(),
                        artifact,
                    },
                    Ok(Err(e)) => PrefetchOutcome::Failed(e.to_string()),
                    Err(_) => PrefetchOutcome::TimedOut,
                }
            }
        };

        match &outcome {
            PrefetchOutcome::Completed { node, artifact } => info!(
                "[Prefetch] {} cached on {} in {:.1}s",
                artifact,
                node,
                prefetch_start.elapsed().as_secs_f64()
            ),
            PrefetchOutcome::Failed(e) => warn!("[Prefetch] Failed on {}: {}", request.node, e),
            PrefetchOutcome::TimedOut => warn!(
                "[Prefetch] Timed out after {:?} on {}",
                request.timeout, request.node
            ),
            PrefetchOutcome::Cancelled => info!("[Prefetch] Cancelled on {}", request.node),
        }

        let _ = sender.send(outcome);
    });

    PrefetchHandle { receiver, task }
}

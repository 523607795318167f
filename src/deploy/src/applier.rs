//! Idempotent resource primitives: namespaces, manifests, Helm releases,
//! readiness waits and secrets.
//!
//! Every operation can be repeated with the same inputs; a second call is a
//! no-op on the cluster. Failures are fatal to the calling step unless the
//! operation is explicitly wrapped in [`retry`].

use crate::backend::{
    ClusterBackend, Labels, ManifestSource, PackageManager, ReleaseSpec, WorkloadKind,
};
use crate::error::{DeployError, Result};
use crate::retry::{retry, RetryPolicy};
use crate::template::TemplateRenderer;
use serde_json::Value;
use serde_yaml::Mapping;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Inputs for [`ResourceApplier::install_or_upgrade_release`].
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub name: String,
    pub chart: String,
    pub version: Option<String>,
    pub namespace: String,
    /// YAML values file, rendered through Tera when `template_data` is set.
    pub values_file: Option<PathBuf>,
    pub template_data: Option<Value>,
    /// Top-level keys that replace the file's values.
    pub overrides: Mapping,
    pub wait: bool,
    pub timeout: Duration,
    pub reuse_values: bool,
    pub create_namespace: bool,
}

impl ReleaseRequest {
    pub fn new(
        name: impl Into<String>,
        chart: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            chart: chart.into(),
            version: None,
            namespace: namespace.into(),
            values_file: None,
            template_data: None,
            overrides: Mapping::new(),
            wait: true,
            timeout: Duration::from_secs(600),
            reuse_values: false,
            create_namespace: true,
        }
    }
}

/// Merge `overrides` into `base`; override wins key by key at the top level.
pub fn merge_values(base: &mut Mapping, overrides: &Mapping) {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
}

pub struct ResourceApplier {
    cluster: Arc<dyn ClusterBackend>,
    packages: Arc<dyn PackageManager>,
    renderer: Arc<TemplateRenderer>,
    cancel: CancellationToken,
    manifest_retry: RetryPolicy,
    poll_interval: Duration,
}

impl ResourceApplier {
    pub fn new(
        cluster: Arc<dyn ClusterBackend>,
        packages: Arc<dyn PackageManager>,
        renderer: Arc<TemplateRenderer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            packages,
            renderer,
            cancel,
            manifest_retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_manifest_retry(mut self, policy: RetryPolicy) -> Self {
        self.manifest_retry = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(DeployError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Create the namespace if absent, then apply labels with overwrite.
    pub async fn ensure_namespace(&self, name: &str, labels: &Labels) -> Result<()> {
        self.check_cancelled()?;

        if self.cluster.namespace_exists(name).await? {
            tracing::debug!("[Applier] Namespace {} already exists", name);
        } else {
            match self.cluster.create_namespace(name).await {
                Ok(()) => tracing::info!("[Applier] Created namespace {}", name),
                Err(e) if e.is_already_exists() => {
                    tracing::debug!("[Applier] Namespace {} created concurrently", name)
                }
                Err(e) => return Err(e),
            }
        }

        if !labels.is_empty() {
            self.cluster.label_namespace(name, labels).await?;
            tracing::debug!("[Applier] Labeled namespace {} ({} labels)", name, labels.len());
        }
        Ok(())
    }

    /// Render `source` against `data` (when given) and apply it.
    pub async fn apply_manifest(&self, source: &ManifestSource, data: Option<&Value>) -> Result<()> {
        self.check_cancelled()?;

        let resolved = match (source, data) {
            (_, None) => source.clone(),
            (ManifestSource::Path(path), Some(data)) => {
                ManifestSource::Content(self.renderer.render_file(path, data)?)
            }
            (ManifestSource::Content(content), Some(data)) => {
                ManifestSource::Content(self.renderer.render_str(content, data)?)
            }
            (ManifestSource::Url(url), Some(_)) => {
                return Err(DeployError::Config(format!(
                    "cannot render template data into remote manifest {}",
                    url
                )))
            }
        };

        tracing::info!("[Applier] Applying {}", source.describe());
        self.cluster.apply_manifest(&resolved).await
    }

    /// [`apply_manifest`](Self::apply_manifest) retried through webhook
    /// propagation windows.
    pub async fn apply_manifest_with_retry(
        &self,
        label: &str,
        source: &ManifestSource,
        data: Option<&Value>,
    ) -> Result<()> {
        retry(&self.cancel, &self.manifest_retry, label, || {
            self.apply_manifest(source, data)
        })
        .await
    }

    pub async fn ensure_repository(&self, name: &str, url: &str) -> Result<()> {
        self.check_cancelled()?;
        self.packages.add_repository(name, url).await?;
        self.packages.update_repositories().await?;
        tracing::debug!("[Applier] Helm repository {} -> {}", name, url);
        Ok(())
    }

    pub async fn release_exists(&self, name: &str, namespace: &str) -> Result<bool> {
        self.check_cancelled()?;
        self.packages.release_exists(name, namespace).await
    }

    /// Load a values file, rendering it first when template data is present.
    pub fn load_values(&self, request: &ReleaseRequest) -> Result<Mapping> {
        let Some(path) = &request.values_file else {
            return Ok(Mapping::new());
        };
        let content = match &request.template_data {
            Some(data) => self.renderer.render_file(path, data)?,
            None => std::fs::read_to_string(path).map_err(|e| {
                DeployError::Config(format!(
                    "Failed to read values file {}: {}",
                    path.display(),
                    e
                ))
            })?,
        };
        if content.trim().is_empty() {
            return Ok(Mapping::new());
        }
        match serde_yaml::from_str::<serde_yaml::Value>(&content)? {
            serde_yaml::Value::Mapping(map) => Ok(map),
            serde_yaml::Value::Null => Ok(Mapping::new()),
            _ => Err(DeployError::Config(format!(
                "values file {} is not a mapping",
                path.display()
            ))),
        }
    }

    /// Install the release, or upgrade it in place when it already exists.
    pub async fn install_or_upgrade_release(&self, request: &ReleaseRequest) -> Result<()> {
        self.check_cancelled()?;

        let mut values = self.load_values(request)?;
        merge_values(&mut values, &request.overrides);

        let spec = ReleaseSpec {
            name: request.name.clone(),
            chart: request.chart.clone(),
            version: request.version.clone(),
            namespace: request.namespace.clone(),
            values,
            wait: request.wait,
            timeout: request.timeout,
            reuse_values: request.reuse_values,
            create_namespace: request.create_namespace,
        };

        let start = Instant::now();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DeployError::Cancelled),
            result = self.packages.install_or_upgrade(&spec) => {
                result?;
                tracing::info!(
                    "[TIMING] Release {} ready in {}ms",
                    spec.name,
                    start.elapsed().as_millis()
                );
                Ok(())
            }
        }
    }

    /// Poll until the workload's ready replicas reach its desired count.
    ///
    /// A workload scaled to zero is ready at 0/0. A DaemonSet reporting 0/0 has
    /// not been scheduled yet and keeps the wait going.
    pub async fn wait_for_readiness(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        tracing::info!(
            "[Applier] Waiting for {} {}/{} to become ready",
            kind,
            namespace,
            name
        );
        let start = Instant::now();

        loop {
            self.check_cancelled()?;

            let status = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
                status = self.cluster.workload_status(kind, namespace, name) => status?,
            };
            let scheduled = |desired: i64| kind != WorkloadKind::DaemonSet || desired > 0;

            match status {
                Some(status) if scheduled(status.desired) && status.is_ready() => {
                    tracing::info!(
                        "[Applier] {} {}/{} ready ({}/{}) after {:?}",
                        kind,
                        namespace,
                        name,
                        status.ready,
                        status.desired,
                        start.elapsed()
                    );
                    return Ok(());
                }
                Some(status) => tracing::debug!(
                    "[Applier] {} {}/{}: {}/{} ready",
                    kind,
                    namespace,
                    name,
                    status.ready,
                    status.desired
                ),
                None => tracing::debug!("[Applier] {} {}/{} not found yet", kind, namespace, name),
            }

            if start.elapsed() >= timeout {
                return Err(DeployError::Timeout {
                    what: format!("{} {}/{} readiness", kind, namespace, name),
                    timeout,
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Wait for `condition` on `resource` (e.g. `deployment/foo`).
    pub async fn wait_for_condition(
        &self,
        resource: &str,
        namespace: Option<&str>,
        condition: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.check_cancelled()?;
        let wait = self
            .cluster
            .wait_for_condition(resource, namespace, condition, timeout);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DeployError::Cancelled),
            result = tokio::time::timeout(timeout + self.poll_interval, wait) => match result {
                Ok(inner) => inner,
                Err(_) => Err(DeployError::Timeout {
                    what: format!("{} condition {}", resource, condition),
                    timeout,
                }),
            },
        }
    }

    /// Poll until the cluster reports at least `expected` nodes.
    pub async fn wait_for_nodes(&self, expected: usize, timeout: Duration) -> Result<usize> {
        let start = Instant::now();
        loop {
            self.check_cancelled()?;
            let listed = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
                listed = self.cluster.list_nodes() => listed,
            };
            match listed {
                Ok(nodes) if nodes.len() >= expected => {
                    tracing::info!(
                        "[Applier] {} nodes registered (took {:?})",
                        nodes.len(),
                        start.elapsed()
                    );
                    return Ok(nodes.len());
                }
                Ok(nodes) => tracing::debug!(
                    "[Applier] {}/{} nodes registered",
                    nodes.len(),
                    expected
                ),
                Err(e) if e.is_retryable() => {
                    tracing::debug!("[Applier] Node listing not available yet: {}", e)
                }
                Err(e) => return Err(e),
            }

            if start.elapsed() >= timeout {
                return Err(DeployError::Timeout {
                    what: format!("{} cluster nodes", expected),
                    timeout,
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Return the existing secret's data, or create it from `generate()`.
    pub async fn create_or_reuse_secret<F>(
        &self,
        namespace: &str,
        name: &str,
        generate: F,
    ) -> Result<Labels>
    where
        F: FnOnce() -> Labels,
    {
        self.check_cancelled()?;

        if let Some(existing) = self.cluster.get_secret(namespace, name).await? {
            tracing::info!("[Applier] Reusing secret {}/{}", namespace, name);
            return Ok(existing);
        }

        let data = generate();
        match self.cluster.create_secret(namespace, name, &data).await {
            Ok(()) => {
                tracing::info!("[Applier] Created secret {}/{}", namespace, name);
                Ok(data)
            }
            Err(e) if e.is_already_exists() => self
                .cluster
                .get_secret(namespace, name)
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }
}

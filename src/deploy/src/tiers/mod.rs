//! Cumulative deployment tiers.
//!
//! Requesting tier N runs tiers 0..=N in order, each as a fixed step list
//! through a [`StepRunner`]. The first fatal step aborts the run with a
//! [`TierFailure`]; whatever was already applied stays on the cluster and a
//! re-run picks up idempotently.

pub mod application;
pub mod base;
pub mod infra;
pub mod platform;

use crate::applier::{ReleaseRequest, ResourceApplier};
use crate::backend::{
    ClusterBackend, ClusterLifecycle, HelmBackend, K3dLifecycle, KubectlBackend, NodeInfo,
    PackageManager,
};
use crate::config::{ComponentConfig, LabConfig};
use crate::error::{DeployError, Result, TierFailure};
use crate::prefetch::PrefetchHandle;
use crate::progress::ProgressReporter;
use crate::retry::{retry, RetryPolicy};
use crate::steps::StepRunner;
use crate::template::TemplateRenderer;
use serde::Serialize;
use serde_json::Value;
use serde_yaml::Mapping;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Tier {
    ClusterBase = 0,
    Infrastructure = 1,
    Platform = 2,
    Application = 3,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::ClusterBase,
        Tier::Infrastructure,
        Tier::Platform,
        Tier::Application,
    ];

    pub fn from_index(index: u8) -> Result<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or_else(|| DeployError::Config(format!("tier must be 0..=3, got {}", index)))
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::ClusterBase => "cluster base",
            Tier::Infrastructure => "infrastructure",
            Tier::Platform => "platform",
            Tier::Application => "application",
        }
    }

    /// Declared step names, in execution order.
    pub fn steps(self) -> &'static [&'static str] {
        match self {
            Tier::ClusterBase => base::STEPS,
            Tier::Infrastructure => infra::STEPS,
            Tier::Platform => platform::STEPS,
            Tier::Application => application::STEPS,
        }
    }

    /// Every tier from 0 through `self`.
    pub fn up_to(self) -> impl Iterator<Item = Tier> {
        Self::ALL.into_iter().take(self.index() as usize + 1)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {} ({})", self.index(), self.label())
    }
}

/// Credentials produced by the platform tier and consumed by the application tier.
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedCredentials {
    pub iam_admin_user: String,
    pub iam_admin_password: String,
    pub app_client_id: String,
    pub app_client_secret: String,
}

impl fmt::Debug for GeneratedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedCredentials")
            .field("iam_admin_user", &self.iam_admin_user)
            .field("iam_admin_password", &"<redacted>")
            .field("app_client_id", &self.app_client_id)
            .field("app_client_secret", &"<redacted>")
            .finish()
    }
}

/// What a successful run hands back to the caller.
#[derive(Debug)]
pub struct DeploymentOutcome {
    pub completed_tiers: Vec<Tier>,
    pub elected_node: Option<String>,
    pub credentials: Option<GeneratedCredentials>,
    pub prefetch: Option<PrefetchHandle>,
}

/// The three backend capabilities a run needs.
#[derive(Clone)]
pub struct Backends {
    pub cluster: Arc<dyn ClusterBackend>,
    pub packages: Arc<dyn PackageManager>,
    pub lifecycle: Arc<dyn ClusterLifecycle>,
}

impl Backends {
    /// kubectl, helm and k3d driven as subprocesses.
    pub fn subprocess(config: &LabConfig) -> Self {
        let context = config.cluster.context();
        Self {
            cluster: Arc::new(KubectlBackend::new(Some(context.as_str()))),
            packages: Arc::new(HelmBackend::new(Some(context.as_str()))),
            lifecycle: Arc::new(K3dLifecycle::new(config.cluster.clone())),
        }
    }
}

/// Everything a tier step can reach.
pub struct TierContext {
    pub config: Arc<LabConfig>,
    pub applier: ResourceApplier,
    pub cluster: Arc<dyn ClusterBackend>,
    pub lifecycle: Arc<dyn ClusterLifecycle>,
    pub cancel: CancellationToken,
    pub retry_policy: RetryPolicy,
}

impl TierContext {
    pub fn new(config: LabConfig, backends: Backends, cancel: CancellationToken) -> Result<Self> {
        let renderer = match &config.templates_dir {
            Some(dir) => TemplateRenderer::new(config.resolve_path(dir))?,
            None => TemplateRenderer::empty(),
        };
        let retry_policy = config.retry_policy();
        let applier = ResourceApplier::new(
            backends.cluster.clone(),
            backends.packages,
            Arc::new(renderer),
            cancel.clone(),
        )
        .with_manifest_retry(retry_policy)
        .with_poll_interval(Duration::from_secs(config.readiness.poll_interval_secs));

        Ok(Self {
            config: Arc::new(config),
            applier,
            cluster: backends.cluster,
            lifecycle: backends.lifecycle,
            cancel,
            retry_policy,
        })
    }

    pub fn component(&self, key: &str) -> Result<&ComponentConfig> {
        self.config.component(key)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.config.readiness.timeout_secs)
    }

    /// Release request for a configured component, paths resolved.
    pub fn release_request(&self, component: &ComponentConfig) -> ReleaseRequest {
        let mut request = ReleaseRequest::new(
            component.release.as_str(),
            component.chart.as_str(),
            component.namespace.as_str(),
        );
        request.version = component.version.clone();
        request.values_file = component
            .values_file
            .as_deref()
            .map(|p| self.config.resolve_path(p));
        request.wait = component.wait;
        request.timeout = component.timeout();
        request.create_namespace = component.create_namespace;
        request
    }

    /// Register the component's chart repository (if any) and install or
    /// upgrade its release, retrying through webhook propagation.
    pub async fn install_component(
        &self,
        key: &str,
        template_data: Option<Value>,
        overrides: Mapping,
    ) -> Result<()> {
        let request = self.prepare_component(key, template_data, overrides).await?;
        self.install_with_retry(key, &request).await
    }

    /// Like [`install_component`](Self::install_component), but an existing
    /// release is upgraded with reused values, so values a later tier layered
    /// onto it survive a re-run of this one.
    pub async fn install_component_reusing_values(
        &self,
        key: &str,
        template_data: Option<Value>,
        overrides: Mapping,
    ) -> Result<()> {
        let mut request = self.prepare_component(key, template_data, overrides).await?;
        request.reuse_values = self
            .applier
            .release_exists(&request.name, &request.namespace)
            .await?;
        if request.reuse_values {
            tracing::info!(
                "[Tiers] Release {} exists, upgrading with reused values",
                request.name
            );
        }
        self.install_with_retry(key, &request).await
    }

    async fn prepare_component(
        &self,
        key: &str,
        template_data: Option<Value>,
        overrides: Mapping,
    ) -> Result<ReleaseRequest> {
        let component = self.component(key)?;
        if let (Some(name), Some(url)) = (&component.repo_name, &component.repo_url) {
            self.applier.ensure_repository(name, url).await?;
        }

        let mut request = self.release_request(component);
        request.template_data = template_data;
        request.overrides = overrides;
        Ok(request)
    }

    pub async fn install_with_retry(&self, label: &str, request: &ReleaseRequest) -> Result<()> {
        retry(&self.cancel, &self.retry_policy, label, || {
            self.applier.install_or_upgrade_release(request)
        })
        .await
    }

    /// Wait for every workload the component lists under `wait_for`.
    pub async fn wait_for_component(&self, key: &str) -> Result<()> {
        let component = self.component(key)?;
        if component.wait_for.is_empty() {
            tracing::debug!("[Tiers] No readiness targets for {}", key);
            return Ok(());
        }
        for target in &component.wait_for {
            let namespace = target.namespace.as_deref().unwrap_or(&component.namespace);
            self.applier
                .wait_for_readiness(target.kind, namespace, &target.name, self.readiness_timeout())
                .await?;
        }
        Ok(())
    }
}

/// Drives tiers 0..=N through per-tier step runners.
pub struct TierOrchestrator {
    context: TierContext,
    reporter: Arc<dyn ProgressReporter>,
}

impl TierOrchestrator {
    pub fn new(
        config: LabConfig,
        backends: Backends,
        reporter: Arc<dyn ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            context: TierContext::new(config, backends, cancel)?,
            reporter,
        })
    }

    pub fn context(&self) -> &TierContext {
        &self.context
    }

    /// Run every tier up to and including `target`.
    pub async fn run(&self, target: Tier) -> Result<DeploymentOutcome> {
        let mut outcome = DeploymentOutcome {
            completed_tiers: Vec::new(),
            elected_node: None,
            credentials: None,
            prefetch: None,
        };
        let deploy_start = std::time::Instant::now();

        for tier in target.up_to() {
            tracing::info!("[Tiers] Starting {}", tier);
            let mut runner = StepRunner::new(tier.to_string(), tier.steps(), self.reporter.clone());
            let ctx = &self.context;

            let result = match tier {
                Tier::ClusterBase => base::run(ctx, &mut runner)
                    .await
                    .map(|elected| outcome.elected_node = elected),
                Tier::Infrastructure => infra::run(ctx, &mut runner).await,
                Tier::Platform => platform::run(ctx, &mut runner)
                    .await
                    .map(|credentials| outcome.credentials = Some(credentials)),
                Tier::Application => match outcome.credentials.clone() {
                    Some(credentials) => application::run(
                        ctx,
                        &mut runner,
                        &credentials,
                        outcome.elected_node.as_deref(),
                    )
                    .await
                    .map(|handle| outcome.prefetch = handle),
                    None => Err(DeployError::Config(
                        "application tier needs platform credentials".into(),
                    )),
                },
            };

            if let Err(source) = result {
                let failure = tier_failure(tier, &runner, source);
                tracing::error!("[Tiers] {}", failure);
                return Err(failure.into());
            }

            runner.complete();
            outcome.completed_tiers.push(tier);
            tracing::info!("[Tiers] Completed {}", tier);
        }

        tracing::info!(
            "[TIMING] Deployment up to {} completed in {}ms",
            target,
            deploy_start.elapsed().as_millis()
        );
        Ok(outcome)
    }
}

fn tier_failure(tier: Tier, runner: &StepRunner, source: DeployError) -> TierFailure {
    let (step_index, step_name) = match runner.state().failed_step() {
        Some(step) => (step.index, step.name.clone()),
        None => {
            let index = runner.state().current_index;
            let name = runner
                .steps()
                .get(index)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            (index, name)
        }
    };
    TierFailure {
        tier,
        step_index,
        step_name,
        source: Box::new(source),
    }
}

/// Cluster state as shown by `labctl status`.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub running: bool,
    pub nodes: Vec<NodeInfo>,
}

pub async fn cluster_status(backends: &Backends) -> Result<ClusterStatus> {
    let running = backends.lifecycle.is_running().await?;
    let nodes = if running {
        backends.cluster.list_nodes().await?
    } else {
        Vec::new()
    };
    Ok(ClusterStatus { running, nodes })
}

/// What [`teardown`] does to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    Stop,
    Delete,
}

/// Stop or delete the cluster. Host-service failures only warn.
pub async fn teardown(
    lifecycle: &dyn ClusterLifecycle,
    config: &LabConfig,
    mode: TeardownMode,
) -> Result<()> {
    for service in &config.cluster.host_services {
        let result = match mode {
            TeardownMode::Stop => lifecycle.stop_host_service(service).await,
            TeardownMode::Delete => lifecycle.remove_host_service(service).await,
        };
        match result {
            Ok(()) => tracing::info!("[Teardown] {:?} host service {}", mode, service),
            Err(e) => tracing::warn!("[Teardown] Host service {}: {}", service, e),
        }
    }

    match mode {
        TeardownMode::Stop => lifecycle.stop().await?,
        TeardownMode::Delete => lifecycle.delete().await?,
    }
    tracing::info!("[Teardown] Cluster {} {:?} done", config.cluster.name, mode);
    Ok(())
}

/// PackageManager implemented with the helm CLI. Values are streamed on stdin.
use super::command::{args, CommandRunner};
use super::{PackageManager, ReleaseSpec};
use crate::error::Result;
use async_trait::async_trait;

pub struct HelmBackend {
    runner: CommandRunner,
}

impl HelmBackend {
    pub fn new(kube_context: Option<&str>) -> Self {
        let base_args = kube_context
            .map(|c| vec!["--kube-context".to_string(), c.to_string()])
            .unwrap_or_default();
        Self {
            runner: CommandRunner::new("helm").with_base_args(base_args),
        }
    }
}

/// Build `helm upgrade --install` arguments for a release.
pub fn helm_upgrade_args(release: &ReleaseSpec) -> Vec<String> {
    let mut argv = args([
        "upgrade",
        "--install",
        &release.name,
        &release.chart,
        "--namespace",
        &release.namespace,
    ]);
    if let Some(version) = &release.version {
        argv.extend(args(["--version", version]));
    }
    if release.create_namespace {
        argv.push("--create-namespace".to_string());
    }
    if release.wait {
        argv.push("--wait".to_string());
    }
    argv.push(format!("--timeout={}s", release.timeout.as_secs()));
    if release.reuse_values {
        argv.push("--reuse-values".to_string());
    }
    if !release.values.is_empty() {
        argv.extend(args(["--values", "-"]));
    }
    argv
}

#[async_trait]
impl PackageManager for HelmBackend {
    async fn add_repository(&self, name: &str, url: &str) -> Result<()> {
        self.runner
            .run(
                "helm repo add",
                &args(["repo", "add", name, url, "--force-update"]),
                None,
            )
            .await?;
        Ok(())
    }

    async fn update_repositories(&self) -> Result<()> {
        self.runner
            .run("helm repo update", &args(["repo", "update"]), None)
            .await?;
        Ok(())
    }

    async fn install_or_upgrade(&self, release: &ReleaseSpec) -> Result<()> {
        let values = if release.values.is_empty() {
            None
        } else {
            Some(serde_yaml::to_string(&release.values)?)
        };
        tracing::info!(
            "[Helm] upgrade --install {} ({}) in {}",
            release.name,
            release.chart,
            release.namespace
        );
        self.runner
            .run(
                &format!("helm upgrade {}", release.name),
                &helm_upgrade_args(release),
                values.as_deref(),
            )
            .await?;
        Ok(())
    }

    async fn release_exists(&self, name: &str, namespace: &str) -> Result<bool> {
        match self
            .runner
            .run("helm status", &args(["status", name, "-n", namespace]), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

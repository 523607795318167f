//! Tier 1: certificates, trust distribution and the gateway.
use super::TierContext;
use crate::backend::ManifestSource;
use crate::config::component;
use crate::error::{DeployError, Result};
use crate::steps::StepRunner;
use serde_json::{json, Value};
use serde_yaml::Mapping;
use std::path::Path;

pub const STEPS: &[&str] = &[
    "Install cert-manager",
    "Wait for cert-manager webhook",
    "Install trust-manager",
    "Publish CA bundle",
    "Mount CA into CNI",
    "Install gateway",
];

/// Template looked up under `templates_dir` before falling back to
/// [`CA_BUNDLE_MANIFEST`].
pub const CA_BUNDLE_TEMPLATE: &str = "manifests/ca-bundle.yaml.j2";

pub const CA_BUNDLE_NAME: &str = "lab-root-ca";

const CA_BUNDLE_MANIFEST: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ bundle_name }}-source
  namespace: {{ namespace }}
data:
  ca.crt: |
{{ ca_pem }}
---
apiVersion: trust.cert-manager.io/v1alpha1
kind: Bundle
metadata:
  name: {{ bundle_name }}
spec:
  sources:
    - useDefaultCAs: true
    - configMap:
        name: {{ bundle_name }}-source
        key: ca.crt
  target:
    configMap:
      key: ca.crt
"#;

fn indent_block(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{}{}", prefix, line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn read_ca(path: &Path) -> Result<String> {
    let pem = std::fs::read_to_string(path).map_err(|e| {
        DeployError::Config(format!("Failed to read CA certificate {}: {}", path.display(), e))
    })?;
    if !pem.contains("BEGIN CERTIFICATE") {
        return Err(DeployError::Config(format!(
            "{} is not a PEM certificate",
            path.display()
        )));
    }
    Ok(pem)
}

fn bundle_data(namespace: &str, pem: &str) -> Value {
    json!({
        "bundle_name": CA_BUNDLE_NAME,
        "namespace": namespace,
        "ca_pem": indent_block(pem.trim_end(), "    "),
    })
}

pub async fn run(ctx: &TierContext, runner: &mut StepRunner) -> Result<()> {
    let ca_path = ctx
        .config
        .pki
        .ca_cert_path
        .as_deref()
        .map(|p| ctx.config.resolve_path(p));
    let ca_path = ca_path.as_deref();

    runner
        .run_step("Install cert-manager", || async move {
            ctx.install_component(component::CERT_MANAGER, None, Mapping::new())
                .await
        })
        .await?;

    runner
        .run_step("Wait for cert-manager webhook", || async move {
            let cert_manager = ctx.component(component::CERT_MANAGER)?;
            if !cert_manager.wait_for.is_empty() {
                return ctx.wait_for_component(component::CERT_MANAGER).await;
            }
            ctx.applier
                .wait_for_condition(
                    &format!("deployment/{}-webhook", cert_manager.release),
                    Some(cert_manager.namespace.as_str()),
                    "Available",
                    ctx.readiness_timeout(),
                )
                .await
        })
        .await?;

    runner
        .run_step("Install trust-manager", || async move {
            ctx.install_component(component::TRUST_MANAGER, None, Mapping::new())
                .await?;
            ctx.wait_for_component(component::TRUST_MANAGER).await
        })
        .await?;

    runner
        .run_step("Publish CA bundle", || async move {
            let Some(path) = ca_path else {
                tracing::info!("[Infrastructure] No CA certificate configured, skipping bundle");
                return Ok(());
            };
            let pem = read_ca(path)?;
            let trust = ctx.component(component::TRUST_MANAGER)?;
            let data = bundle_data(&trust.namespace, &pem);
            let source = if ctx.applier.renderer().has_template(CA_BUNDLE_TEMPLATE) {
                ManifestSource::Content(ctx.applier.renderer().render(CA_BUNDLE_TEMPLATE, &data)?)
            } else {
                ManifestSource::Content(ctx.applier.renderer().render_str(CA_BUNDLE_MANIFEST, &data)?)
            };
            ctx.applier
                .apply_manifest_with_retry("CA bundle", &source, None)
                .await
        })
        .await?;

    runner
        .run_step("Mount CA into CNI", || async move {
            let cni = ctx.component(component::CNI)?;
            let (Some(_), Some(values_file)) = (ca_path, &cni.ca_values_file) else {
                tracing::info!("[Infrastructure] CNI has no CA values, skipping");
                return Ok(());
            };
            let mut request = ctx.release_request(cni);
            request.values_file = Some(ctx.config.resolve_path(values_file));
            request.template_data = Some(json!({
                "bundle_name": CA_BUNDLE_NAME,
                "ca_key": "ca.crt",
            }));
            request.reuse_values = true;
            ctx.install_with_retry("CNI CA mount", &request).await?;
            ctx.wait_for_component(component::CNI).await
        })
        .await?;

    runner
        .run_step("Install gateway", || async move {
            ctx.install_component(component::GATEWAY, None, Mapping::new())
                .await?;
            ctx.wait_for_component(component::GATEWAY).await
        })
        .await
}

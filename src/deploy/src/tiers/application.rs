//! Tier 3: the application workload.
use super::{GeneratedCredentials, TierContext};
use crate::backend::Labels;
use crate::config::component;
use crate::error::Result;
use crate::prefetch::{spawn_prefetch, PrefetchHandle, PrefetchRequest};
use crate::steps::StepRunner;
use serde_json::json;
use serde_yaml::{Mapping, Value as YamlValue};
use std::time::Duration;

pub const STEPS: &[&str] = &[
    "Create application namespace",
    "Create application secrets",
    "Start model prefetch",
    "Install application",
    "Wait for application",
];

pub const CLIENT_SECRET_NAME: &str = "application-oidc";

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Top-level override pinning the workload to `node`.
pub fn node_selector_override(node: &str) -> Mapping {
    let mut selector = Mapping::new();
    selector.insert(YamlValue::from(HOSTNAME_LABEL), YamlValue::from(node));
    let mut overrides = Mapping::new();
    overrides.insert(YamlValue::from("nodeSelector"), YamlValue::Mapping(selector));
    overrides
}

/// Returns the prefetch handle when a prefetch was launched.
pub async fn run(
    ctx: &TierContext,
    runner: &mut StepRunner,
    credentials: &GeneratedCredentials,
    elected_node: Option<&str>,
) -> Result<Option<PrefetchHandle>> {
    runner
        .run_step("Create application namespace", || async move {
            let app = ctx.component(component::APPLICATION)?;
            ctx.applier
                .ensure_namespace(&app.namespace, &app.namespace_labels)
                .await
        })
        .await?;

    runner
        .run_step("Create application secrets", || async move {
            let app = ctx.component(component::APPLICATION)?;
            let data = ctx
                .applier
                .create_or_reuse_secret(&app.namespace, CLIENT_SECRET_NAME, || {
                    Labels::from([
                        ("client-id".to_string(), credentials.app_client_id.clone()),
                        (
                            "client-secret".to_string(),
                            credentials.app_client_secret.clone(),
                        ),
                    ])
                })
                .await?;
            if data.get("client-id") != Some(&credentials.app_client_id) {
                tracing::warn!(
                    "[Application] Secret {} holds a different client id, keeping it",
                    CLIENT_SECRET_NAME
                );
            }
            Ok(())
        })
        .await?;

    let prefetch = runner
        .run_step("Start model prefetch", || async move {
            let settings = &ctx.config.prefetch;
            if !settings.enabled {
                tracing::info!("[Application] Prefetch disabled");
                return Ok(None);
            }
            let Some(node) = elected_node else {
                tracing::info!("[Application] No elected node, skipping prefetch");
                return Ok(None);
            };
            let app_values = ctx
                .config
                .components
                .get(component::APPLICATION)
                .and_then(|app| app.values_file.as_deref());
            let Some(values_file) = settings.values_file.as_deref().or(app_values) else {
                tracing::warn!("[Application] Prefetch enabled without a values file, skipping");
                return Ok(None);
            };
            let request = PrefetchRequest {
                node: node.to_string(),
                values_file: ctx.config.resolve_path(values_file),
                image_key: settings.image_key.clone(),
                timeout: Duration::from_secs(settings.timeout_secs),
            };
            Ok(Some(spawn_prefetch(
                request,
                ctx.lifecycle.clone(),
                &ctx.cancel,
            )))
        })
        .await?;

    runner
        .run_step("Install application", || async move {
            let gpu_enabled = ctx.config.gpu.mode()?.is_enabled() && !ctx.config.gpu.force_cpu;
            let data = json!({
                "client_id": credentials.app_client_id,
                "client_secret_name": CLIENT_SECRET_NAME,
                "elected_node": elected_node,
                "gpu_enabled": gpu_enabled,
            });
            let overrides = elected_node
                .map(node_selector_override)
                .unwrap_or_default();
            ctx.install_component(component::APPLICATION, Some(data), overrides)
                .await
        })
        .await?;

    runner
        .run_step("Wait for application", || {
            ctx.wait_for_component(component::APPLICATION)
        })
        .await?;

    Ok(prefetch)
}

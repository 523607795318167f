//! Tier orchestration against the recording fake backends.

mod common;

use common::{lab_config, multi_node, FakeEnv};
use deploy::backend::ReleaseSpec;
use deploy::error::{BackendErrorKind, DeployError};
use deploy::nodes::ACCELERATOR_LABEL;
use deploy::prefetch::PrefetchOutcome;
use deploy::progress::{RecordingReporter, StepState};
use deploy::tiers::{teardown, TeardownMode, Tier, TierOrchestrator};
use serde_yaml::Value as YamlValue;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn orchestrator(env: &FakeEnv, reporter: &Arc<RecordingReporter>) -> TierOrchestrator {
    TierOrchestrator::new(
        lab_config(),
        env.backends(),
        reporter.clone(),
        CancellationToken::new(),
    )
    .unwrap()
}

fn expected_events(tiers: &[Tier]) -> Vec<(usize, String, StepState)> {
    let mut events = Vec::new();
    for tier in tiers {
        for (index, name) in tier.steps().iter().enumerate() {
            events.push((index, name.to_string(), StepState::Started));
            events.push((index, name.to_string(), StepState::Completed));
        }
    }
    events
}

fn installed(env: &FakeEnv) -> Vec<String> {
    env.packages
        .releases()
        .iter()
        .map(|r: &ReleaseSpec| r.name.clone())
        .collect()
}

#[test]
fn step_lists_are_pinned() {
    assert_eq!(
        Tier::ClusterBase.steps(),
        &[
            "Start cluster",
            "Wait for nodes",
            "Mount BPF filesystem",
            "Install CNI",
            "Wait for CNI",
            "Label nodes",
            "Elect workload node",
        ]
    );
    assert_eq!(
        Tier::Infrastructure.steps(),
        &[
            "Install cert-manager",
            "Wait for cert-manager webhook",
            "Install trust-manager",
            "Publish CA bundle",
            "Mount CA into CNI",
            "Install gateway",
        ]
    );
    assert_eq!(
        Tier::Platform.steps(),
        &[
            "Create IAM namespace",
            "Generate IAM credentials",
            "Install IAM",
            "Wait for IAM",
            "Install observability",
        ]
    );
    assert_eq!(
        Tier::Application.steps(),
        &[
            "Create application namespace",
            "Create application secrets",
            "Start model prefetch",
            "Install application",
            "Wait for application",
        ]
    );
}

#[test]
fn tier_indices_are_cumulative() {
    let tiers: Vec<Tier> = Tier::Platform.up_to().collect();
    assert_eq!(
        tiers,
        vec![Tier::ClusterBase, Tier::Infrastructure, Tier::Platform]
    );
    assert_eq!(Tier::from_index(3).unwrap(), Tier::Application);
    assert!(matches!(Tier::from_index(4), Err(DeployError::Config(_))));
}

#[tokio::test]
async fn tier_two_runs_tiers_zero_to_two_in_order() {
    let env = FakeEnv::new(multi_node());
    let reporter = Arc::new(RecordingReporter::new());

    let outcome = orchestrator(&env, &reporter)
        .run(Tier::Platform)
        .await
        .unwrap();

    assert_eq!(
        outcome.completed_tiers,
        vec![Tier::ClusterBase, Tier::Infrastructure, Tier::Platform]
    );
    assert_eq!(
        reporter.tuples(),
        expected_events(&[Tier::ClusterBase, Tier::Infrastructure, Tier::Platform])
    );
    assert_eq!(reporter.finished_phases().len(), 3);

    assert_eq!(
        installed(&env),
        vec![
            "cilium",
            "cert-manager",
            "trust-manager",
            "envoy-gateway",
            "keycloak",
            "monitoring"
        ]
    );
    assert!(env.packages.release("inference").is_none());
    assert!(outcome.prefetch.is_none());

    assert_eq!(outcome.elected_node.as_deref(), Some("w1"));
    assert_eq!(env.cluster.node("w1").label(ACCELERATOR_LABEL), Some("nvidia"));
    assert_eq!(env.log.count("exec "), 3);
    assert!(env.log.contains("add_repository cilium https://helm.cilium.io"));
    assert!(env
        .log
        .contains("wait_for_condition cert-manager deployment/cert-manager-webhook Available"));

    let credentials = outcome.credentials.unwrap();
    assert_eq!(credentials.iam_admin_user, "admin");
    assert_eq!(credentials.iam_admin_password.len(), 32);
    assert_ne!(credentials.iam_admin_password, credentials.app_client_secret);
    assert!(!format!("{:?}", credentials).contains(&credentials.iam_admin_password));
}

#[tokio::test]
async fn application_tier_consumes_platform_credentials() {
    let env = FakeEnv::new(multi_node());
    let reporter = Arc::new(RecordingReporter::new());

    let outcome = orchestrator(&env, &reporter)
        .run(Tier::Application)
        .await
        .unwrap();
    assert_eq!(outcome.completed_tiers.len(), 4);

    let credentials = outcome.credentials.unwrap();
    let app_secret = env.cluster.secret("apps", "application-oidc").unwrap();
    assert_eq!(app_secret.get("client-id"), Some(&credentials.app_client_id));
    assert_eq!(
        app_secret.get("client-secret"),
        Some(&credentials.app_client_secret)
    );

    let release = env.packages.release("inference").unwrap();
    let selector = release
        .values
        .get("nodeSelector")
        .and_then(YamlValue::as_mapping)
        .unwrap();
    assert_eq!(
        selector.get("kubernetes.io/hostname"),
        Some(&YamlValue::from("w1"))
    );
    assert!(env
        .log
        .contains("workload_status deployment/apps/inference"));
}

#[tokio::test]
async fn rerun_reuses_credentials_and_namespaces() {
    let env = FakeEnv::new(multi_node());
    let reporter = Arc::new(RecordingReporter::new());
    let orchestrator = orchestrator(&env, &reporter);

    let first = orchestrator.run(Tier::Application).await.unwrap();
    let second = orchestrator.run(Tier::Application).await.unwrap();

    assert_eq!(first.credentials, second.credentials);
    assert_eq!(env.log.count("create_secret"), 2);
    assert_eq!(env.log.count("create_namespace"), 2);
    assert_eq!(env.log.count("start"), 1);
}

#[tokio::test]
async fn failure_reports_tier_step_and_cause() {
    let env = FakeEnv::new(multi_node());
    env.packages
        .failures
        .push("install keycloak", BackendErrorKind::Other, 1);
    let reporter = Arc::new(RecordingReporter::new());

    let err = orchestrator(&env, &reporter)
        .run(Tier::Application)
        .await
        .unwrap_err();

    let failure = match err {
        DeployError::Tier(failure) => failure,
        other => panic!("expected a tier failure, got {:?}", other),
    };
    assert_eq!(failure.tier, Tier::Platform);
    assert_eq!(failure.step_index, 2);
    assert_eq!(failure.step_name, "Install IAM");
    assert_eq!(failure.source.kind(), Some(BackendErrorKind::Other));
    assert!(failure
        .to_string()
        .starts_with("tier 2 (platform) failed at step 3 (Install IAM): "));

    let tuples = reporter.tuples();
    let (index, name, state) = tuples.last().unwrap();
    assert_eq!((*index, name.as_str()), (2, "Install IAM"));
    assert!(matches!(state, StepState::Failed(_)));
    assert!(!tuples.iter().any(|(_, name, _)| name == "Wait for IAM"));
    assert!(env.packages.release("inference").is_none());
    assert_eq!(reporter.finished_phases().len(), 2);
}

#[tokio::test]
async fn missing_component_fails_its_step() {
    let env = FakeEnv::new(multi_node());
    let mut config = lab_config();
    config.components.remove("gateway");
    let reporter = Arc::new(RecordingReporter::new());

    let err = TierOrchestrator::new(config, env.backends(), reporter.clone(), CancellationToken::new())
        .unwrap()
        .run(Tier::Infrastructure)
        .await
        .unwrap_err();

    match err {
        DeployError::Tier(failure) => {
            assert_eq!(failure.tier, Tier::Infrastructure);
            assert_eq!(failure.step_name, "Install gateway");
            assert!(matches!(*failure.source, DeployError::Config(_)));
        }
        other => panic!("expected a tier failure, got {:?}", other),
    }
}

#[tokio::test]
async fn cancelled_run_stops_at_first_cancellable_step() {
    let env = FakeEnv::new(multi_node());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let reporter = Arc::new(RecordingReporter::new());

    let err = TierOrchestrator::new(lab_config(), env.backends(), reporter, cancel)
        .unwrap()
        .run(Tier::Application)
        .await
        .unwrap_err();

    match err {
        DeployError::Tier(failure) => {
            assert_eq!(failure.tier, Tier::ClusterBase);
            assert_eq!(failure.step_name, "Wait for nodes");
            assert!(matches!(*failure.source, DeployError::Cancelled));
        }
        other => panic!("expected a tier failure, got {:?}", other),
    }
}

#[tokio::test]
async fn ca_bundle_is_published_when_configured() {
    let env = FakeEnv::new(multi_node());
    let mut ca = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        ca,
        "-----BEGIN CERTIFICATE-----\nMIIBlab\n-----END CERTIFICATE-----"
    )
    .unwrap();
    let mut config = lab_config();
    config.pki.ca_cert_path = Some(ca.path().to_path_buf());
    let reporter = Arc::new(RecordingReporter::new());

    TierOrchestrator::new(config, env.backends(), reporter, CancellationToken::new())
        .unwrap()
        .run(Tier::Infrastructure)
        .await
        .unwrap();

    let manifests = env.cluster.manifests();
    assert_eq!(manifests.len(), 1);
    let deploy::ManifestSource::Content(body) = &manifests[0] else {
        panic!("expected inline manifest");
    };
    assert!(body.contains("kind: Bundle"));
    assert!(body.contains("namespace: cert-manager"));
    assert!(body.contains("    MIIBlab"));
    let docs: Vec<YamlValue> = body
        .split("\n---\n")
        .map(|doc| serde_yaml::from_str(doc).unwrap())
        .collect();
    assert_eq!(docs.len(), 2);
}

#[tokio::test]
async fn rerunning_cluster_base_keeps_the_cni_ca_mount() {
    let env = FakeEnv::new(multi_node());
    let mut ca = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        ca,
        "-----BEGIN CERTIFICATE-----\nMIIBlab\n-----END CERTIFICATE-----"
    )
    .unwrap();
    let mut ca_values = tempfile::NamedTempFile::new().unwrap();
    write!(
        ca_values,
        "extraVolumes:\n  - name: lab-ca\n    configMap:\n      name: {{{{ bundle_name }}}}\n"
    )
    .unwrap();
    let mut config = lab_config();
    config.pki.ca_cert_path = Some(ca.path().to_path_buf());
    config.components.get_mut("cni").unwrap().ca_values_file = Some(ca_values.path().to_path_buf());
    let reporter = Arc::new(RecordingReporter::new());
    let orchestrator =
        TierOrchestrator::new(config, env.backends(), reporter, CancellationToken::new()).unwrap();

    orchestrator.run(Tier::Infrastructure).await.unwrap();
    orchestrator.run(Tier::ClusterBase).await.unwrap();

    let cilium: Vec<ReleaseSpec> = env
        .packages
        .releases()
        .into_iter()
        .filter(|r| r.name == "cilium")
        .collect();
    assert_eq!(cilium.len(), 3);
    assert!(!cilium[0].reuse_values);
    assert!(cilium[1].reuse_values);
    assert!(cilium[1].values.contains_key("extraVolumes"));
    assert!(cilium[2].reuse_values);
}

#[tokio::test]
async fn incomplete_credentials_secret_is_regenerated() {
    let env = FakeEnv::new(multi_node());
    env.cluster.insert_secret(
        "iam",
        "iam-credentials",
        [("admin-user".to_string(), "admin".to_string())].into(),
    );
    let reporter = Arc::new(RecordingReporter::new());

    let outcome = orchestrator(&env, &reporter)
        .run(Tier::Platform)
        .await
        .unwrap();

    assert!(env.log.contains("delete_secret iam/iam-credentials"));
    let credentials = outcome.credentials.unwrap();
    let secret = env.cluster.secret("iam", "iam-credentials").unwrap();
    assert_eq!(secret.len(), 4);
    assert_eq!(secret.get("admin-password"), Some(&credentials.iam_admin_password));
}

#[tokio::test]
async fn prefetch_runs_on_elected_node() {
    let env = FakeEnv::new(multi_node());
    let mut values = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        values,
        "image:\n  registry: registry.lab.local\n  repository: models/llm\n  tag: \"1.2\""
    )
    .unwrap();
    let mut config = lab_config();
    config.prefetch.enabled = true;
    config.prefetch.values_file = Some(values.path().to_path_buf());
    let reporter = Arc::new(RecordingReporter::new());

    let outcome = TierOrchestrator::new(config, env.backends(), reporter, CancellationToken::new())
        .unwrap()
        .run(Tier::Application)
        .await
        .unwrap();

    let handle = outcome.prefetch.expect("prefetch launched");
    assert_eq!(
        handle.wait().await,
        PrefetchOutcome::Completed {
            node: "w1".to_string(),
            artifact: "registry.lab.local/models/llm:1.2".to_string(),
        }
    );
    assert!(env
        .log
        .contains("exec w1 crictl pull registry.lab.local/models/llm:1.2"));
}

#[tokio::test]
async fn teardown_tolerates_host_service_failures() {
    let env = FakeEnv::new(multi_node());
    env.lifecycle
        .failures
        .push("stop_host_service", BackendErrorKind::NotFound, 1);
    let config = lab_config();

    teardown(env.lifecycle.as_ref(), &config, TeardownMode::Stop)
        .await
        .unwrap();
    assert!(env.log.contains("stop_host_service lab-dns"));
    assert!(!env.log.contains("stop_host_service lab-registry"));
    assert!(env.log.contains("stop"));

    teardown(env.lifecycle.as_ref(), &config, TeardownMode::Delete)
        .await
        .unwrap();
    assert_eq!(env.log.count("remove_host_service"), 2);
    assert!(env.log.contains("delete"));
}

//! Tier 2: identity and observability.
use super::{GeneratedCredentials, TierContext};
use crate::backend::Labels;
use crate::config::component;
use crate::error::{DeployError, Result};
use crate::steps::StepRunner;
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde_json::json;
use serde_yaml::Mapping;

pub const STEPS: &[&str] = &[
    "Create IAM namespace",
    "Generate IAM credentials",
    "Install IAM",
    "Wait for IAM",
    "Install observability",
];

pub const CREDENTIALS_SECRET: &str = "iam-credentials";
pub const ADMIN_USER: &str = "admin";
pub const APP_CLIENT_ID: &str = "lab-application";

const KEY_ADMIN_USER: &str = "admin-user";
const KEY_ADMIN_PASSWORD: &str = "admin-password";
const KEY_CLIENT_ID: &str = "client-id";
const KEY_CLIENT_SECRET: &str = "client-secret";

const SECRET_LENGTH: usize = 32;

fn random_secret() -> String {
    Alphanumeric.sample_string(&mut OsRng, SECRET_LENGTH)
}

/// Fresh credential set for a first install.
pub fn generate_credentials() -> Labels {
    Labels::from([
        (KEY_ADMIN_USER.to_string(), ADMIN_USER.to_string()),
        (KEY_ADMIN_PASSWORD.to_string(), random_secret()),
        (KEY_CLIENT_ID.to_string(), APP_CLIENT_ID.to_string()),
        (KEY_CLIENT_SECRET.to_string(), random_secret()),
    ])
}

impl GeneratedCredentials {
    /// Read credentials back from secret data.
    pub fn from_secret(data: &Labels) -> Result<Self> {
        let field = |key: &str| {
            data.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| {
                    DeployError::Config(format!(
                        "secret {} is missing key {}",
                        CREDENTIALS_SECRET, key
                    ))
                })
        };
        Ok(Self {
            iam_admin_user: field(KEY_ADMIN_USER)?,
            iam_admin_password: field(KEY_ADMIN_PASSWORD)?,
            app_client_id: field(KEY_CLIENT_ID)?,
            app_client_secret: field(KEY_CLIENT_SECRET)?,
        })
    }
}

pub async fn run(ctx: &TierContext, runner: &mut StepRunner) -> Result<GeneratedCredentials> {
    runner
        .run_step("Create IAM namespace", || async move {
            let iam = ctx.component(component::IAM)?;
            ctx.applier
                .ensure_namespace(&iam.namespace, &iam.namespace_labels)
                .await
        })
        .await?;

    let credentials = runner
        .run_step("Generate IAM credentials", || async move {
            let iam = ctx.component(component::IAM)?;
            let data = ctx
                .applier
                .create_or_reuse_secret(&iam.namespace, CREDENTIALS_SECRET, generate_credentials)
                .await?;
            match GeneratedCredentials::from_secret(&data) {
                Ok(credentials) => Ok(credentials),
                Err(e) => {
                    tracing::warn!("[Platform] Replacing unusable credentials: {}", e);
                    ctx.cluster
                        .delete_secret(&iam.namespace, CREDENTIALS_SECRET)
                        .await?;
                    let data = ctx
                        .applier
                        .create_or_reuse_secret(
                            &iam.namespace,
                            CREDENTIALS_SECRET,
                            generate_credentials,
                        )
                        .await?;
                    GeneratedCredentials::from_secret(&data)
                }
            }
        })
        .await?;

    let credentials_ref = &credentials;
    runner
        .run_step("Install IAM", || async move {
            let data = json!({
                "admin_user": credentials_ref.iam_admin_user,
                "credentials_secret": CREDENTIALS_SECRET,
                "client_id": credentials_ref.app_client_id,
            });
            ctx.install_component(component::IAM, Some(data), Mapping::new())
                .await
        })
        .await?;

    runner
        .run_step("Wait for IAM", || ctx.wait_for_component(component::IAM))
        .await?;

    runner
        .run_step("Install observability", || async move {
            ctx.install_component(component::OBSERVABILITY, None, Mapping::new())
                .await?;
            ctx.wait_for_component(component::OBSERVABILITY).await
        })
        .await?;

    Ok(credentials)
}

use crate::tiers::Tier;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

/// Tag attached by a backend to every failed remote call.
///
/// The retrier decides on the tag alone, so backends are the only place that
/// look at raw error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Admission webhook registered but not reachable yet.
    WebhookUnavailable,
    ConnectionRefused,
    OperationNotPermitted,
    /// Low-level dial failure (no route, i/o timeout while connecting).
    DialFailure,
    NotFound,
    AlreadyExists,
    Other,
}

impl BackendErrorKind {
    /// Symptoms of CNI or webhook routing that has not propagated yet.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            BackendErrorKind::WebhookUnavailable
                | BackendErrorKind::ConnectionRefused
                | BackendErrorKind::OperationNotPermitted
                | BackendErrorKind::DialFailure
        )
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{operation} failed: {message}")]
    Backend {
        kind: BackendErrorKind,
        operation: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{label} failed after {retries} retries: {source}")]
    RetriesExhausted {
        label: String,
        retries: u32,
        source: Box<DeployError>,
    },

    #[error("no master node found")]
    NoControlPlane,

    #[error("Node {0} not found in cluster")]
    NodeNotFound(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Step '{requested}' run out of order, expected '{expected}'")]
    StepOrder { requested: String, expected: String },

    #[error("Step '{0}' skipped because an earlier step failed")]
    StepAborted(String),

    #[error(transparent)]
    Tier(#[from] TierFailure),
}

impl DeployError {
    pub fn backend(
        kind: BackendErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        DeployError::Backend {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Backend tag, if this error came from a backend call.
    pub fn kind(&self) -> Option<BackendErrorKind> {
        match self {
            DeployError::Backend { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_some_and(BackendErrorKind::is_retryable)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == Some(BackendErrorKind::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == Some(BackendErrorKind::AlreadyExists)
    }
}

/// A tier aborted on its first fatal step.
#[derive(Debug, Error)]
#[error("{tier} failed at step {} ({step_name}): {source}", .step_index + 1)]
pub struct TierFailure {
    pub tier: Tier,
    /// Zero-based index within the tier's step list.
    pub step_index: usize,
    pub step_name: String,
    pub source: Box<DeployError>,
}

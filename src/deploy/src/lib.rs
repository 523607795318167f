//! Lab deployment core
//!
//! Drives a local k3d cluster through four cumulative tiers (cluster base,
//! infrastructure, platform, application) with idempotent resource
//! application, bounded retries for transient webhook/CNI failures, and
//! GPU/CPU node role assignment.

pub mod error;
pub mod progress;
pub mod retry;
pub mod steps;

pub use error::{BackendErrorKind, DeployError, Result, TierFailure};
pub use progress::{
    ChannelProgressReporter, ProgressMessage, ProgressReporter, RecordingReporter, StepEvent,
    StepState, TracingReporter,
};
pub use retry::{retry, RetryPolicy};
pub use steps::{DeploymentStep, StepOutcome, StepRunState, StepRunner, StepStatus};

// Backends (kubectl, helm, k3d) and their traits
pub mod backend;
pub use backend::{
    ClusterBackend, ClusterLifecycle, ManifestSource, NodeInfo, PackageManager, WorkloadKind,
};

pub mod applier;
pub mod config;
pub mod nodes;
pub mod prefetch;
pub mod template;

pub use applier::{merge_values, ReleaseRequest, ResourceApplier};
pub use config::{LabConfig, CONFIG_FILE_NAME};
pub use nodes::{GpuAssignment, GpuMode, NodePlan, Topology};
pub use prefetch::{spawn_prefetch, PrefetchHandle, PrefetchOutcome, PrefetchRequest};
pub use template::TemplateRenderer;

// Tier orchestration
pub mod tiers;
pub use tiers::{
    cluster_status, teardown, Backends, DeploymentOutcome, GeneratedCredentials, TeardownMode,
    Tier, TierOrchestrator,
};

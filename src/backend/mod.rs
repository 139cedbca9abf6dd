//! Cloud backend capability traits
//!
//! The orchestrator talks to compute/network/storage through a small set of
//! capability traits (`Provisioner`, `HealthProbe`, `Destroyer`, ...) with
//! concrete variants selected at configuration time. Orchestration logic
//! never branches on a backend type; it only sees `Arc<dyn CloudBackend>`.
//!
//! Every call is treated as fallible, latent and eventually consistent:
//! callers wrap each one in a config-driven timeout and never assume a
//! destroy request means the resource is gone (that is what the post-hoc
//! cleanup audit is for).

pub mod sim;

pub use sim::SimBackend;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::cost::{CapacityCandidate, CapacityType, ResourceSpec};

/// Errors surfaced by backend calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The requested capacity pool has no available instances (typical for
    /// spot). The controller falls through to the next plan candidate.
    #[error("capacity unavailable: {class} ({capacity})")]
    CapacityUnavailable {
        class: String,
        capacity: CapacityType,
    },

    /// The backend did not answer in time.
    #[error("backend timed out: {0}")]
    Timeout(String),

    /// Throttled by the provider; retryable after backoff.
    #[error("backend rate limited")]
    RateLimited,

    /// Any other API-level failure.
    #[error("backend api error: {0}")]
    Api(String),

    /// The referenced resource does not exist (already gone is success for
    /// teardown paths; callers decide).
    #[error("backend resource not found: {0}")]
    NotFound(String),

    /// The backend lacks this capability (e.g. suspend).
    #[error("operation not supported by backend: {0}")]
    NotSupported(&'static str),
}

impl BackendError {
    /// Transient failures are retried locally before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited)
    }
}

/// One provisioning attempt: a single plan candidate for a session.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub session_id: String,
    pub user_id: String,
    pub spec: ResourceSpec,
    pub candidate: CapacityCandidate,
}

/// Connection details handed to the remote-display transport once a
/// session is Active. The orchestrator treats the credential as an opaque
/// reference; it never holds the secret itself.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEndpoint {
    pub host: String,
    pub port: u16,
    pub credential_ref: String,
}

/// What a successful provisioning attempt yields.
#[derive(Debug, Clone)]
pub struct ProvisionedInstance {
    pub instance_id: String,
    pub capacity: CapacityType,
    pub instance_class: String,
    /// Actual spot price at launch; None for on-demand.
    pub spot_price: Option<f64>,
    pub endpoint: ConnectionEndpoint,
    /// Opaque handles consumed by the isolation validator and cleanup.
    pub storage_handle: String,
    pub network_handle: String,
}

/// Spot interruption warning delivered on the interruption channel.
#[derive(Debug, Clone)]
pub struct InterruptionWarning {
    pub instance_id: String,
}

/// Liveness + readiness snapshot from one probe.
#[derive(Debug, Clone, Copy)]
pub struct HealthReport {
    pub alive: bool,
    pub ready: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.alive && self.ready
    }
}

/// The four separation guarantees validated between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLayer {
    Compute,
    Network,
    Storage,
    Runtime,
}

impl IsolationLayer {
    pub const ALL: [IsolationLayer; 4] = [
        IsolationLayer::Compute,
        IsolationLayer::Network,
        IsolationLayer::Storage,
        IsolationLayer::Runtime,
    ];
}

impl std::fmt::Display for IsolationLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Network => write!(f, "network"),
            Self::Storage => write!(f, "storage"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Evidence gathered for one isolation layer. A transient `BackendError`
/// instead of a finding maps to the `Unknown` outcome at the validator.
#[derive(Debug, Clone)]
pub struct LayerFinding {
    pub passed: bool,
    pub violations: Vec<String>,
}

impl LayerFinding {
    pub fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    pub fn fail(violation: impl Into<String>) -> Self {
        Self {
            passed: false,
            violations: vec![violation.into()],
        }
    }
}

/// Kinds of backend resources tracked by the inventory / orphan sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Instance,
    Volume,
    NetworkSegment,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance => write!(f, "instance"),
            Self::Volume => write!(f, "volume"),
            Self::NetworkSegment => write!(f, "network-segment"),
        }
    }
}

/// One live backend resource and the session it is tagged with, if any.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
    pub session_id: Option<String>,
}

/// Provisions capacity and publishes spot interruption warnings.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Attempt to provision the given candidate. `CapacityUnavailable`
    /// means "try the next rung of the plan", anything else is a real
    /// failure for this attempt.
    async fn provision(
        &self,
        req: &ProvisionRequest,
    ) -> Result<ProvisionedInstance, BackendError>;

    /// Interruption-warning stream. Warnings must never be silently
    /// dropped: the controller either replaces the VM in time or forces
    /// the session into Terminating.
    fn subscribe_interruptions(&self) -> broadcast::Receiver<InterruptionWarning>;
}

/// Periodic liveness + readiness probing.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance_id: &str) -> Result<HealthReport, BackendError>;
}

/// Teardown operations. `forced` selects the alternate API path / forced
/// parameters used by the fallback and emergency retry rungs.
#[async_trait]
pub trait Destroyer: Send + Sync {
    /// Ask the in-guest applications to shut down cleanly.
    async fn graceful_shutdown(&self, instance_id: &str) -> Result<(), BackendError>;

    /// Secure-delete session-scoped temporary storage.
    async fn sanitize_storage(&self, storage_handle: &str, forced: bool)
        -> Result<(), BackendError>;

    /// Request instance termination and wait for the backend to confirm
    /// the instance is gone. Callers bound this with the destroy timeout.
    async fn destroy(&self, instance_id: &str, forced: bool) -> Result<(), BackendError>;

    async fn reclaim_storage(&self, storage_handle: &str, forced: bool)
        -> Result<(), BackendError>;

    async fn reclaim_network(&self, network_handle: &str, forced: bool)
        -> Result<(), BackendError>;
}

/// Per-layer isolation evidence for a provisioned instance.
#[async_trait]
pub trait IsolationInspector: Send + Sync {
    async fn inspect(
        &self,
        layer: IsolationLayer,
        instance_id: &str,
    ) -> Result<LayerFinding, BackendError>;
}

/// Inventory of live backend resources; the basis of the orphan sweep and
/// the post-cleanup residual audit.
#[async_trait]
pub trait ResourceInventory: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<ResourceRef>, BackendError>;
}

/// Full capability bundle the orchestrator is constructed with.
#[async_trait]
pub trait CloudBackend:
    Provisioner + HealthProbe + Destroyer + IsolationInspector + ResourceInventory
{
    /// Whether suspend/resume (billing actually pauses) is available.
    fn supports_suspend(&self) -> bool {
        false
    }

    async fn suspend_instance(&self, _instance_id: &str) -> Result<(), BackendError> {
        Err(BackendError::NotSupported("suspend"))
    }

    async fn resume_instance(&self, _instance_id: &str) -> Result<(), BackendError> {
        Err(BackendError::NotSupported("resume"))
    }
}

//! Orchestrator error taxonomy
//!
//! Every failure surfaced to a caller is a typed variant so that UIs can
//! distinguish "your request failed, retry is safe" (e.g. `QuotaExceeded`)
//! from "your session was destroyed for cause" (e.g. `SpotReclaimed`,
//! `BudgetExceeded`). Transient backend errors are retried inside the
//! component that hit them and only surface here once the local retry
//! budget is exhausted.

use tokio::time::Duration;

use crate::backend::BackendError;

/// Errors produced by the orchestrator's public contract.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The caller already holds the maximum number of non-terminal
    /// sessions, or the requested resources exceed the per-user quota.
    #[error("quota exceeded for user {user_id}: {reason}")]
    QuotaExceeded { user_id: String, reason: String },

    /// Every capacity fallback in the provisioning plan was exhausted.
    #[error("provisioning failed after {attempts} capacity attempt(s): {last_error}")]
    ProvisioningFailed { attempts: usize, last_error: String },

    /// Spot capacity was reclaimed and no on-demand replacement could be
    /// provisioned within the interruption grace window.
    #[error("spot capacity reclaimed for instance {instance_id}")]
    SpotReclaimed { instance_id: String },

    /// The isolation validator reported violations; the session was never
    /// exposed and its VM is being destroyed.
    #[error("isolation violation for session {session_id}: {violations:?}")]
    IsolationViolation {
        session_id: String,
        violations: Vec<String>,
    },

    /// The VM failed its health probe `consecutive` times in a row.
    #[error("health check failed for instance {instance_id} ({consecutive} consecutive failures)")]
    HealthCheckFailed {
        instance_id: String,
        consecutive: u32,
    },

    /// Accrued cost crossed the configured budget limit.
    #[error("session {session_id} exceeded budget: ${spent:.4} > ${limit:.4}")]
    BudgetExceeded {
        session_id: String,
        spent: f64,
        limit: f64,
    },

    /// The backend did not confirm instance termination within the destroy
    /// timeout. The cleanup orchestrator escalates this.
    #[error("destroy of instance {instance_id} timed out after {timeout:?}")]
    DestroyTimeout {
        instance_id: String,
        timeout: Duration,
    },

    /// Emergency-tier cleanup was exhausted; the resource is flagged for
    /// the scheduled sweep instead of blocking termination forever.
    #[error("resource {resource_id} suspected orphaned after cleanup exhaustion")]
    OrphanedSuspected { resource_id: String },

    /// The configured backend does not implement the requested capability
    /// (e.g. suspend/resume on a backend that cannot pause billing).
    #[error("{operation} is not supported by the configured backend")]
    Unsupported { operation: &'static str },

    /// No session with that id in the active set or the audit window.
    #[error("session not found: {session_id}")]
    NotFound { session_id: String },

    /// A state transition was requested along an edge the state machine
    /// does not define. Callers treating terminate as idempotent never
    /// see this; it guards internal invariants.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A backend call failed after local retries.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Rejected at construction time by `Config::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OrchestratorError {
    /// True when the caller may simply retry the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. } | Self::NotFound { .. } => true,
            Self::Backend(e) => e.is_transient(),
            _ => false,
        }
    }

    /// True when the session was (or is being) destroyed for cause rather
    /// than the request merely failing.
    pub fn is_destruction(&self) -> bool {
        matches!(
            self,
            Self::SpotReclaimed { .. }
                | Self::BudgetExceeded { .. }
                | Self::IsolationViolation { .. }
                | Self::HealthCheckFailed { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

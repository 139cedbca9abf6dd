//! Session state machine
//!
//! One record per user desktop allocation:
//!
//! ```text
//!   Pending -> Provisioning -> Validating -> Active <-> Idle
//!                  |               |            |        |
//!                  +---> Failed <--+------------+--------+
//!                           |
//!   (any non-terminal) -> Terminating -> Terminated
//! ```
//!
//! plus `Suspended` (reachable from Active when the backend can pause
//! billing). All state mutation goes through `try_transition`, a
//! compare-and-set against an explicit edge table, so concurrent actors
//! (drive task, sweep, health monitor, explicit terminate) can never
//! produce an undefined transition or a lost update.

pub mod manager;

pub use manager::SessionManager;

use serde::Serialize;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::backend::ConnectionEndpoint;
use crate::cost::{CapacityType, ResourceSpec};
use crate::error::{OrchestratorError, Result};
use crate::vm::VmHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Provisioning,
    Validating,
    Active,
    Idle,
    Suspended,
    Failed,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Validating => "validating",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// The defined edges of the state machine. Everything else is an
    /// `InvalidTransition`.
    fn permits(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Pending, Provisioning)
                | (Pending, Terminating)
                | (Provisioning, Validating)
                | (Provisioning, Failed)
                | (Provisioning, Terminating)
                | (Validating, Active)
                | (Validating, Failed)
                | (Validating, Terminating)
                | (Active, Idle)
                | (Active, Suspended)
                | (Active, Failed)
                | (Active, Terminating)
                | (Idle, Active)
                | (Idle, Failed)
                | (Idle, Terminating)
                | (Suspended, Active)
                | (Suspended, Terminating)
                | (Failed, Terminating)
                | (Terminating, Terminated)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was (or is being) torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserRequested,
    Idle,
    Expired,
    BudgetExceeded,
    SpotReclaimed,
    IsolationViolation,
    HealthCheckFailed,
    ProvisioningFailed,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserRequested => "user_requested",
            Self::Idle => "idle",
            Self::Expired => "expired",
            Self::BudgetExceeded => "budget_exceeded",
            Self::SpotReclaimed => "spot_reclaimed",
            Self::IsolationViolation => "isolation_violation",
            Self::HealthCheckFailed => "health_check_failed",
            Self::ProvisioningFailed => "provisioning_failed",
        };
        f.write_str(s)
    }
}

/// Caller-supplied parameters for one new session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub user_id: String,
    pub spec: ResourceSpec,
    /// Defaults to the configured TTL when absent.
    pub ttl: Option<Duration>,
    /// Per-session spend limit override.
    pub budget: Option<f64>,
}

impl SessionRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            spec: ResourceSpec::default(),
            ttl: None,
            budget: None,
        }
    }
}

/// One session record. Held behind the manager's registry; mutated only
/// under its per-session lock.
#[derive(Debug)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub spec: ResourceSpec,
    pub state: SessionState,
    /// The session's current VM; replaced wholesale on spot replacement.
    pub vm: Option<VmHandle>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub ttl: Duration,
    pub budget: Option<f64>,
    /// Spend folded in from completed billing intervals.
    accrued_cost: f64,
    /// Start of the currently accruing interval; None while billing is
    /// paused (suspended) or stopped (terminated / no VM yet).
    billing_anchor: Option<Instant>,
    pub termination: Option<TerminationReason>,
    pub terminated_at: Option<Instant>,
    /// Latch: set by whichever actor wins ownership of the cleanup
    /// pipeline, so it runs at most once per session.
    pub(super) cleanup_started: bool,
}

impl SessionRecord {
    pub fn new(req: &SessionRequest, default_ttl: Duration, default_budget: Option<f64>) -> Self {
        let now = Instant::now();
        Self {
            id: format!("sess-{}", Uuid::now_v7()),
            user_id: req.user_id.clone(),
            spec: req.spec,
            state: SessionState::Pending,
            vm: None,
            created_at: now,
            last_activity: now,
            ttl: req.ttl.unwrap_or(default_ttl),
            budget: req.budget.or(default_budget),
            accrued_cost: 0.0,
            billing_anchor: None,
            termination: None,
            terminated_at: None,
            cleanup_started: false,
        }
    }

    /// Compare-and-set on the state field. Succeeds only when the current
    /// state is one of `from` and the edge to `to` is defined.
    pub fn try_transition(&mut self, from: &[SessionState], to: SessionState) -> Result<()> {
        if !from.contains(&self.state) || !self.state.permits(to) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Start (or restart) accruing cost at the current VM's rate.
    pub fn start_billing(&mut self) {
        self.billing_anchor = Some(Instant::now());
    }

    /// Fold the open billing interval into the accumulator and pause.
    /// Idempotent; called on suspend, on VM replacement and at
    /// termination (after which the accumulator never changes again).
    pub fn fold_billing(&mut self) {
        if let (Some(anchor), Some(vm)) = (self.billing_anchor.take(), self.vm.as_ref()) {
            self.accrued_cost += anchor.elapsed().as_secs_f64() / 3600.0 * vm.hourly_rate;
        }
    }

    /// Current estimated spend: folded intervals plus the open one.
    /// Monotone while the session lives; frozen once billing is folded at
    /// termination.
    pub fn current_cost(&self) -> f64 {
        let open = match (&self.billing_anchor, &self.vm) {
            (Some(anchor), Some(vm)) => anchor.elapsed().as_secs_f64() / 3600.0 * vm.hourly_rate,
            _ => 0.0,
        };
        self.accrued_cost + open
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            state: self.state,
            instance_id: self.vm.as_ref().map(|vm| vm.instance_id.clone()),
            instance_class: self.vm.as_ref().map(|vm| vm.instance_class.clone()),
            capacity: self.vm.as_ref().map(|vm| vm.capacity),
            endpoint: self.vm.as_ref().map(|vm| vm.endpoint.clone()),
            cost: self.current_cost(),
            termination: self.termination,
            age: self.age(),
            idle_for: self.idle_for(),
        }
    }
}

/// Read-only view handed to callers; never aliases the live record.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub user_id: String,
    pub state: SessionState,
    pub instance_id: Option<String>,
    pub instance_class: Option<String>,
    pub capacity: Option<CapacityType>,
    pub endpoint: Option<ConnectionEndpoint>,
    pub cost: f64,
    pub termination: Option<TerminationReason>,
    #[serde(skip)]
    pub age: Duration,
    #[serde(skip)]
    pub idle_for: Duration,
}

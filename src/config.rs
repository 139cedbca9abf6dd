//! Static orchestrator configuration
//!
//! All tunables (quotas, TTLs, timeouts, retry budgets, spot policy) are
//! injected as one plain struct at construction time. The orchestrator
//! never reads files or the environment itself; loading YAML/env config
//! into this struct is the caller's job.

use tokio::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Retry budget for one escalation rung (see `retry::Escalation`).
#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    /// Bounded attempt count for this rung.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (doubled per attempt, jittered).
    pub base_backoff: Duration,
}

/// Per-rung retry budgets for the primary -> fallback -> emergency ladder.
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicies {
    pub primary: TierPolicy,
    pub fallback: TierPolicy,
    pub emergency: TierPolicy,
}

impl Default for EscalationPolicies {
    fn default() -> Self {
        Self {
            primary: TierPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(500),
            },
            fallback: TierPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_secs(2),
            },
            emergency: TierPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_secs(5),
            },
        }
    }
}

/// Orchestrator configuration.
///
/// Durations are wall-clock under a running runtime and virtual under
/// `tokio::time::pause()`, which is what the scenario tests rely on.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Session quotas ---
    /// Maximum non-terminal sessions one user may hold at a time.
    pub max_sessions_per_user: usize,
    /// Per-session resource ceilings; a `ResourceSpec` above either is
    /// rejected with `QuotaExceeded`.
    pub max_vcpus_per_session: u32,
    pub max_memory_gb_per_session: u32,

    // --- Lifecycle timing ---
    /// TTL applied when the request does not carry one.
    pub default_ttl: Duration,
    /// Inactivity span after which the sweep terminates with reason `Idle`.
    pub idle_threshold: Duration,
    /// Interval of the idle/TTL/budget sweep.
    pub sweep_interval: Duration,
    /// How long terminated sessions remain visible to `get_session` and to
    /// the orphan sweep's "recently terminated" check.
    pub audit_retention: Duration,

    // --- Provisioning ---
    /// Timeout for each individual capacity attempt in the plan ladder.
    pub provision_attempt_timeout: Duration,
    /// Window after a spot interruption warning in which an on-demand
    /// replacement must come up before the session is reclaimed.
    pub spot_interruption_grace: Duration,

    // --- Health ---
    pub health_check_interval: Duration,
    /// Bound on a single health probe; expiry counts as a failed probe.
    pub probe_timeout: Duration,
    /// Consecutive probe failures before the VM is marked Unhealthy.
    pub health_failure_threshold: u32,

    // --- Isolation ---
    /// Bound on a single layer inspection; expiry reports the layer
    /// Unknown instead of stalling validation.
    pub isolation_check_timeout: Duration,

    // --- Cleanup ---
    /// Grace given to in-guest applications before the shutdown phase is
    /// considered failed.
    pub graceful_shutdown_grace: Duration,
    /// Bound on waiting for the backend to confirm an instance is gone.
    pub destroy_timeout: Duration,
    /// Bound on every other cleanup phase.
    pub cleanup_phase_timeout: Duration,
    /// Interval of the scheduled orphan sweep.
    pub orphan_sweep_interval: Duration,
    pub retry: EscalationPolicies,

    // --- Cost policy ---
    /// Whether spot capacity may be planned at all.
    pub allow_spot: bool,
    /// Spot candidates with a predicted interruption probability at or
    /// above this are planned after on-demand instead of before.
    pub spot_interruption_threshold: f64,
    /// Hard cap on a candidate's hourly rate; pricier candidates are
    /// dropped from the plan.
    pub max_hourly_cost: Option<f64>,
    /// Absolute per-session spend limit; crossing it terminates the
    /// session with `BudgetExceeded`. Overridable per request.
    pub session_budget: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 1,
            max_vcpus_per_session: 16,
            max_memory_gb_per_session: 64,
            default_ttl: Duration::from_secs(2 * 3600),
            idle_threshold: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(30),
            audit_retention: Duration::from_secs(15 * 60),
            provision_attempt_timeout: Duration::from_secs(60),
            spot_interruption_grace: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(10),
            health_failure_threshold: 3,
            isolation_check_timeout: Duration::from_secs(30),
            graceful_shutdown_grace: Duration::from_secs(60),
            destroy_timeout: Duration::from_secs(90),
            cleanup_phase_timeout: Duration::from_secs(120),
            orphan_sweep_interval: Duration::from_secs(300),
            retry: EscalationPolicies::default(),
            allow_spot: true,
            spot_interruption_threshold: 0.20,
            max_hourly_cost: None,
            session_budget: None,
        }
    }
}

impl Config {
    /// Reject configurations that would make a control loop degenerate
    /// (zero intervals, empty retry budgets, nonsensical thresholds).
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions_per_user == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_sessions_per_user must be at least 1".into(),
            ));
        }
        for (name, d) in [
            ("sweep_interval", self.sweep_interval),
            ("health_check_interval", self.health_check_interval),
            ("orphan_sweep_interval", self.orphan_sweep_interval),
            ("provision_attempt_timeout", self.provision_attempt_timeout),
            ("probe_timeout", self.probe_timeout),
            ("isolation_check_timeout", self.isolation_check_timeout),
            ("destroy_timeout", self.destroy_timeout),
            ("cleanup_phase_timeout", self.cleanup_phase_timeout),
        ] {
            if d.is_zero() {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "{name} must be non-zero"
                )));
            }
        }
        if self.health_failure_threshold == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "health_failure_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.spot_interruption_threshold) {
            return Err(OrchestratorError::InvalidConfig(
                "spot_interruption_threshold must be within [0, 1]".into(),
            ));
        }
        for (name, p) in [
            ("primary", self.retry.primary),
            ("fallback", self.retry.fallback),
            ("emergency", self.retry.emergency),
        ] {
            if p.max_attempts == 0 {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "retry.{name}.max_attempts must be at least 1"
                )));
            }
        }
        if let Some(budget) = self.session_budget {
            if budget <= 0.0 {
                return Err(OrchestratorError::InvalidConfig(
                    "session_budget must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

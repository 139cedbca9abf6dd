//! Escalating retry ladder
//!
//! Cleanup operations climb a three-rung ladder: primary (normal API
//! call), fallback (forced parameters / alternate API path), emergency
//! (most aggressive teardown available). Each rung has a bounded attempt
//! count and exponential backoff with jitter; only once the emergency rung
//! is exhausted does the error surface to the caller.

use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::config::{EscalationPolicies, TierPolicy};
use crate::error::{OrchestratorError, Result};

/// Rungs of the retry ladder, in climbing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Escalation {
    Primary,
    Fallback,
    Emergency,
}

impl Escalation {
    pub const LADDER: [Escalation; 3] = [
        Escalation::Primary,
        Escalation::Fallback,
        Escalation::Emergency,
    ];

    /// Whether operations at this rung should use forced parameters.
    pub fn forced(&self) -> bool {
        !matches!(self, Escalation::Primary)
    }

    fn policy(&self, policies: &EscalationPolicies) -> TierPolicy {
        match self {
            Escalation::Primary => policies.primary,
            Escalation::Fallback => policies.fallback,
            Escalation::Emergency => policies.emergency,
        }
    }
}

impl std::fmt::Display for Escalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Exponential backoff for one attempt at one rung, with up to 25% jitter
/// so that concurrent cleanups do not hammer the backend in lockstep.
fn backoff(policy: TierPolicy, attempt: u32) -> Duration {
    let base = policy.base_backoff.saturating_mul(1 << attempt.min(8));
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    base.mul_f64(1.0 + jitter)
}

/// Run `op` up the escalation ladder until it succeeds or every rung is
/// exhausted. The closure receives the current rung so it can select
/// forced parameters. Returns the value together with the rung that
/// finally succeeded.
pub async fn with_escalation<T, F, Fut>(
    label: &str,
    policies: &EscalationPolicies,
    mut op: F,
) -> Result<(T, Escalation)>
where
    F: FnMut(Escalation) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error: Option<OrchestratorError> = None;

    for rung in Escalation::LADDER {
        let policy = rung.policy(policies);
        for attempt in 0..policy.max_attempts {
            match op(rung).await {
                Ok(value) => return Ok((value, rung)),
                Err(e) => {
                    warn!(
                        operation = label,
                        rung = %rung,
                        attempt = attempt + 1,
                        error = %e,
                        "operation failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
            // No sleep after the rung's final attempt; escalation takes
            // over immediately.
            if attempt + 1 < policy.max_attempts {
                sleep(backoff(policy, attempt)).await;
            }
        }
    }

    Err(last_error.unwrap_or(OrchestratorError::InvalidConfig(
        "retry ladder has no attempts".into(),
    )))
}

//! Isolation validator - session separation evidence
//!
//! Before a session is exposed to its user, four layers (compute,
//! network, storage, runtime) are inspected concurrently. Any explicit
//! violation blocks activation. A transient inspection failure is retried
//! once; if it stays unanswerable the layer is reported `Unknown` and the
//! caller decides whether to re-validate or fail the session.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::{CloudBackend, IsolationLayer};
use crate::config::Config;
use crate::error::Result;

/// Verdict for one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    /// Explicit violations found; messages carried alongside.
    Fail,
    /// The inspector could not answer even after a retry.
    Unknown,
}

/// Aggregated result of one validation round.
#[derive(Debug, Clone, Serialize)]
pub struct IsolationReport {
    pub session_id: String,
    pub instance_id: String,
    pub outcomes: HashMap<IsolationLayer, CheckOutcome>,
    /// Violation messages from all failing layers, prefixed by layer.
    pub violations: Vec<String>,
    /// Passed layers as a percentage of all layers, 0-100.
    pub score: u8,
}

impl IsolationReport {
    /// Every layer passed; the session may activate.
    pub fn is_clean(&self) -> bool {
        self.outcomes.values().all(|o| *o == CheckOutcome::Pass)
    }

    /// At least one layer reported an explicit violation.
    pub fn has_violations(&self) -> bool {
        self.outcomes.values().any(|o| *o == CheckOutcome::Fail)
    }

    /// At least one layer stayed unanswerable.
    pub fn has_unknowns(&self) -> bool {
        self.outcomes.values().any(|o| *o == CheckOutcome::Unknown)
    }
}

pub struct IsolationValidator {
    backend: Arc<dyn CloudBackend>,
    config: Config,
}

impl IsolationValidator {
    pub fn new(backend: Arc<dyn CloudBackend>, config: Config) -> Self {
        Self { backend, config }
    }

    /// Inspect all layers concurrently and aggregate one report.
    pub async fn validate(&self, session_id: &str, instance_id: &str) -> Result<IsolationReport> {
        let checks = IsolationLayer::ALL
            .iter()
            .map(|layer| self.check_layer(*layer, instance_id));
        let results = join_all(checks).await;

        let mut outcomes = HashMap::new();
        let mut violations = Vec::new();
        for (layer, outcome, messages) in results {
            for m in messages {
                violations.push(format!("{layer}: {m}"));
            }
            outcomes.insert(layer, outcome);
        }

        let passed = outcomes
            .values()
            .filter(|o| **o == CheckOutcome::Pass)
            .count();
        let score = (passed * 100 / outcomes.len()) as u8;

        let report = IsolationReport {
            session_id: session_id.to_string(),
            instance_id: instance_id.to_string(),
            outcomes,
            violations,
            score,
        };
        debug!(
            session_id,
            instance_id,
            score = report.score,
            clean = report.is_clean(),
            "isolation validated"
        );
        Ok(report)
    }

    /// One layer: inspect within the configured bound, retrying a
    /// transient error or an expired inspection once. An inspector that
    /// stays unanswerable yields `Unknown`, never a stalled validation.
    async fn check_layer(
        &self,
        layer: IsolationLayer,
        instance_id: &str,
    ) -> (IsolationLayer, CheckOutcome, Vec<String>) {
        for attempt in 0..2 {
            match timeout(
                self.config.isolation_check_timeout,
                self.backend.inspect(layer, instance_id),
            )
            .await
            {
                Ok(Ok(finding)) if finding.passed => {
                    return (layer, CheckOutcome::Pass, Vec::new())
                }
                Ok(Ok(finding)) => return (layer, CheckOutcome::Fail, finding.violations),
                Ok(Err(e)) if e.is_transient() && attempt == 0 => {
                    debug!(%layer, instance_id, error = %e, "transient inspection failure, retrying");
                }
                Ok(Err(e)) => {
                    warn!(%layer, instance_id, error = %e, "isolation layer unanswerable");
                    return (layer, CheckOutcome::Unknown, Vec::new());
                }
                Err(_) => {
                    warn!(
                        %layer,
                        instance_id,
                        timeout = ?self.config.isolation_check_timeout,
                        "isolation inspection did not answer in time"
                    );
                }
            }
        }
        (layer, CheckOutcome::Unknown, Vec::new())
    }
}

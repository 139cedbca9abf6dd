//! Audit trail - structured record of lifecycle decisions
//!
//! Every decision with cost or security consequence (activation after
//! isolation validation, termination with reason, cleanup outcome, orphan
//! reclamation) is emitted as one `AuditEvent`. The default sink writes
//! structured tracing events under the `audit` target; tests use the
//! in-memory sink.

use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::backend::ResourceKind;
use crate::isolation::IsolationReport;

/// One auditable lifecycle decision.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Session passed validation and was exposed to its user.
    SessionActivated {
        session_id: String,
        user_id: String,
        instance_id: String,
        isolation_score: u8,
    },
    /// Activation was refused; the VM is being destroyed.
    IsolationRejected {
        session_id: String,
        violations: Vec<String>,
    },
    /// Session entered Terminating.
    TerminationStarted {
        session_id: String,
        reason: String,
    },
    /// Full cleanup pipeline finished.
    CleanupFinished {
        session_id: String,
        complete: bool,
        orphaned: Vec<String>,
    },
    /// Final cost at termination.
    CostFinalized {
        session_id: String,
        total: f64,
        hourly_rate: f64,
    },
    /// Orphan sweep reclaimed an unowned resource.
    OrphanReclaimed {
        kind: ResourceKind,
        resource_id: String,
    },
}

impl AuditEvent {
    pub fn from_isolation(report: &IsolationReport, user_id: &str) -> Self {
        if report.is_clean() {
            Self::SessionActivated {
                session_id: report.session_id.clone(),
                user_id: user_id.to_string(),
                instance_id: report.instance_id.clone(),
                isolation_score: report.score,
            }
        } else {
            Self::IsolationRejected {
                session_id: report.session_id.clone(),
                violations: report.violations.clone(),
            }
        }
    }
}

/// Destination for audit events. Implementations must be cheap; sinks are
/// called inline on lifecycle paths.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: one structured tracing event per decision, target
/// `audit`, so operators can route the trail separately from app logs.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "audit", %json, "audit event"),
            Err(_) => info!(target: "audit", ?event, "audit event"),
        }
    }
}

/// Test sink collecting events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

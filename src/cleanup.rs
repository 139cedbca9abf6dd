//! Cleanup orchestrator - leak-free teardown and the orphan sweep
//!
//! Termination runs a fixed phase order:
//!
//! ```text
//!   graceful shutdown -> storage sanitization -> instance destroy
//!       -> storage + network reclamation (concurrent) -> state purge
//! ```
//!
//! Every backend-facing phase climbs the retry ladder (primary ->
//! fallback/forced -> emergency) before giving up; an exhausted phase
//! flags its resource `OrphanedSuspected` for the scheduled sweep instead
//! of blocking termination forever. After the phases, a residual audit
//! lists backend resources and verifies nothing tagged to the session
//! survived.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

use crate::backend::{BackendError, CloudBackend, ResourceKind, ResourceRef};
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::metrics::{CLEANUP_DURATION, CLEANUP_ESCALATIONS, LIVE_VMS, ORPHANS_DETECTED};
use crate::retry::{with_escalation, Escalation};
use crate::vm::VmHandle;

/// Why this cleanup is running. Reactive cleanups follow a session
/// termination; scheduled ones are issued by the orphan sweep. A task that
/// needed the emergency retry rung is reported at the Emergency tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupTier {
    Reactive,
    Scheduled,
    Emergency,
}

/// The ordered phases of a session cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    GracefulShutdown,
    SanitizeStorage,
    DestroyInstance,
    ReclaimStorage,
    ReclaimNetwork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// Phase skipped because its resource was already gone.
    Skipped,
}

/// Record of one cleanup phase for the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupTask {
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Highest retry rung the phase reached.
    #[serde(skip)]
    pub rung: Escalation,
}

/// Outcome of one full cleanup pipeline run.
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub session_id: String,
    pub tier: CleanupTier,
    pub tasks: Vec<CleanupTask>,
    /// Backend resources still present after the pipeline; must be empty
    /// for the cleanup to count as complete.
    pub residuals: Vec<ResourceRef>,
    /// Resource ids flagged for the scheduled sweep.
    pub orphaned: Vec<String>,
    pub duration: tokio::time::Duration,
}

impl CleanupReport {
    /// Leak-free: every phase succeeded and the residual audit came back
    /// empty.
    pub fn is_complete(&self) -> bool {
        self.residuals.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.status != TaskStatus::Failed)
    }
}

pub struct CleanupOrchestrator {
    backend: Arc<dyn CloudBackend>,
    config: Config,
}

impl CleanupOrchestrator {
    pub fn new(backend: Arc<dyn CloudBackend>, config: Config) -> Self {
        Self { backend, config }
    }

    /// Run the full pipeline for one session's VM. Never early-returns on
    /// a phase failure: later phases still run so a stuck volume does not
    /// leave a billing instance alive.
    pub async fn run(&self, session_id: &str, vm: &VmHandle, tier: CleanupTier) -> CleanupReport {
        let started = Instant::now();
        let mut tasks = Vec::new();
        let mut orphaned = Vec::new();
        let mut escalated = false;

        // Phase 1: ask in-guest applications to shut down. Best effort; a
        // hung guest must not block destruction.
        let shutdown = timeout(
            self.config.graceful_shutdown_grace,
            self.backend.graceful_shutdown(&vm.instance_id),
        )
        .await;
        tasks.push(CleanupTask {
            kind: TaskKind::GracefulShutdown,
            status: match shutdown {
                Ok(Ok(())) => TaskStatus::Succeeded,
                _ => {
                    warn!(session_id, instance_id = %vm.instance_id, "graceful shutdown did not complete");
                    TaskStatus::Skipped
                }
            },
            rung: Escalation::Primary,
        });

        // Phase 2: secure-delete session-scoped storage before the
        // instance (and its attachment) disappears.
        let sanitize = self
            .escalating_phase(TaskKind::SanitizeStorage, |rung| {
                let handle = vm.storage_handle.clone();
                async move {
                    self.bounded(self.backend.sanitize_storage(&handle, rung.forced()))
                        .await
                }
            })
            .await;
        escalated |= sanitize.rung != Escalation::Primary;
        if sanitize.status == TaskStatus::Failed {
            orphaned.push(vm.storage_handle.clone());
        }
        tasks.push(sanitize);

        // Phase 3: destroy the instance, bounded per attempt.
        let destroy = self
            .escalating_phase(TaskKind::DestroyInstance, |rung| {
                let id = vm.instance_id.clone();
                async move {
                    match timeout(
                        self.config.destroy_timeout,
                        self.backend.destroy(&id, rung.forced()),
                    )
                    .await
                    {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.into()),
                        Err(_) => Err(OrchestratorError::DestroyTimeout {
                            instance_id: id,
                            timeout: self.config.destroy_timeout,
                        }),
                    }
                }
            })
            .await;
        escalated |= destroy.rung != Escalation::Primary;
        if destroy.status == TaskStatus::Succeeded {
            LIVE_VMS.dec();
        } else {
            orphaned.push(vm.instance_id.clone());
        }
        tasks.push(destroy);

        // Phase 4: reclaim storage and network concurrently; both only
        // depend on the instance being gone.
        let (storage, network) = tokio::join!(
            self.escalating_phase(TaskKind::ReclaimStorage, |rung| {
                let handle = vm.storage_handle.clone();
                async move {
                    self.bounded(self.backend.reclaim_storage(&handle, rung.forced()))
                        .await
                }
            }),
            self.escalating_phase(TaskKind::ReclaimNetwork, |rung| {
                let handle = vm.network_handle.clone();
                async move {
                    self.bounded(self.backend.reclaim_network(&handle, rung.forced()))
                        .await
                }
            }),
        );
        escalated |= storage.rung != Escalation::Primary || network.rung != Escalation::Primary;
        if storage.status == TaskStatus::Failed {
            orphaned.push(vm.storage_handle.clone());
        }
        if network.status == TaskStatus::Failed {
            orphaned.push(vm.network_handle.clone());
        }
        tasks.push(storage);
        tasks.push(network);

        // Phase 5 (state purge) is the session manager's side: the record
        // leaves the registry after the audit retention window.

        let residuals = self.audit(session_id, vm).await;
        if !orphaned.is_empty() || !residuals.is_empty() {
            ORPHANS_DETECTED.inc_by((orphaned.len() + residuals.len()) as u64);
        }

        let duration = started.elapsed();
        CLEANUP_DURATION.observe(duration.as_secs_f64());
        let tier = if escalated { CleanupTier::Emergency } else { tier };
        let report = CleanupReport {
            session_id: session_id.to_string(),
            tier,
            tasks,
            residuals,
            orphaned,
            duration,
        };
        if report.is_complete() {
            info!(session_id, tier = ?report.tier, ?duration, "cleanup complete, no residuals");
        } else {
            error!(
                session_id,
                orphaned = ?report.orphaned,
                residuals = report.residuals.len(),
                "cleanup left residual resources, flagged for sweep"
            );
        }
        report
    }

    /// Bound one backend call with the phase timeout. Expiry surfaces as
    /// a timeout error so the retry ladder escalates instead of the
    /// pipeline stalling on an unanswered call.
    async fn bounded<Fut>(&self, call: Fut) -> Result<()>
    where
        Fut: std::future::Future<Output = std::result::Result<(), BackendError>>,
    {
        match timeout(self.config.cleanup_phase_timeout, call).await {
            Ok(result) => result.map_err(OrchestratorError::from),
            Err(_) => Err(OrchestratorError::Backend(BackendError::Timeout(format!(
                "cleanup call did not complete within {:?}",
                self.config.cleanup_phase_timeout
            )))),
        }
    }

    /// Run one phase up the retry ladder, recording the rung it settled at.
    async fn escalating_phase<F, Fut>(&self, kind: TaskKind, op: F) -> CleanupTask
    where
        F: FnMut(Escalation) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let label = format!("{kind:?}");
        match with_escalation(&label, &self.config.retry, op).await {
            Ok(((), rung)) => {
                if rung != Escalation::Primary {
                    CLEANUP_ESCALATIONS.inc();
                }
                CleanupTask {
                    kind,
                    status: TaskStatus::Succeeded,
                    rung,
                }
            }
            Err(e) => {
                CLEANUP_ESCALATIONS.inc();
                error!(phase = ?kind, error = %e, "cleanup phase exhausted all retry rungs");
                CleanupTask {
                    kind,
                    status: TaskStatus::Failed,
                    rung: Escalation::Emergency,
                }
            }
        }
    }

    /// Post-pipeline residual audit: anything the backend still lists for
    /// this session (by tag or by handle) is a leak.
    async fn audit(&self, session_id: &str, vm: &VmHandle) -> Vec<ResourceRef> {
        let handles: HashSet<&str> = [
            vm.instance_id.as_str(),
            vm.storage_handle.as_str(),
            vm.network_handle.as_str(),
        ]
        .into();
        match self.backend.list_resources().await {
            Ok(resources) => resources
                .into_iter()
                .filter(|r| {
                    handles.contains(r.id.as_str())
                        || r.session_id.as_deref() == Some(session_id)
                })
                .collect(),
            Err(e) => {
                warn!(session_id, error = %e, "residual audit could not list resources");
                Vec::new()
            }
        }
    }

    /// Scheduled orphan sweep: reclaim backend resources tagged to no
    /// known session (live or within the audit retention window), or
    /// carrying no session tag at all. Runs at the emergency rung only;
    /// these resources already slipped past a reactive cleanup.
    pub async fn sweep_orphans(&self, known_sessions: &HashSet<String>) -> Result<Vec<ResourceRef>> {
        let resources = self.backend.list_resources().await?;
        let orphans: Vec<ResourceRef> = resources
            .into_iter()
            .filter(|r| match &r.session_id {
                Some(s) => !known_sessions.contains(s),
                None => true,
            })
            .collect();

        if orphans.is_empty() {
            return Ok(orphans);
        }
        ORPHANS_DETECTED.inc_by(orphans.len() as u64);
        warn!(count = orphans.len(), "orphan sweep found unowned resources");

        for orphan in &orphans {
            let result = match orphan.kind {
                ResourceKind::Instance => self.backend.destroy(&orphan.id, true).await,
                ResourceKind::Volume => self.backend.reclaim_storage(&orphan.id, true).await,
                ResourceKind::NetworkSegment => {
                    self.backend.reclaim_network(&orphan.id, true).await
                }
            };
            match result {
                Ok(()) => info!(kind = %orphan.kind, id = %orphan.id, "orphan reclaimed"),
                Err(e) => error!(kind = %orphan.kind, id = %orphan.id, error = %e, "orphan reclamation failed"),
            }
        }
        Ok(orphans)
    }
}

//! Session Manager - owns the registry and the public contract
//!
//! The manager is the single ownership point for the active-session set.
//! Each session is driven by independent async actors (drive task, health
//! monitor, idle/TTL/budget sweep, interruption handler); they coordinate
//! exclusively through the per-session lock and the CAS transition table,
//! so a lost update (e.g. the sweep terminating a session the instant it
//! recovers) is structurally impossible.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::backend::CloudBackend;
use crate::cleanup::{CleanupOrchestrator, CleanupTier};
use crate::config::Config;
use crate::cost::{CostOptimizer, RightSizingAdvice, SpotPreferences};
use crate::error::{OrchestratorError, Result};
use crate::isolation::IsolationValidator;
use crate::metrics::{ACTIVE_SESSIONS, SPOT_INTERRUPTIONS, SWEEP_TERMINATIONS};
use crate::vm::{VmLifecycleController, VmState};

use super::{SessionRecord, SessionRequest, SessionSnapshot, SessionState, TerminationReason};

type SharedSession = Arc<Mutex<SessionRecord>>;

struct Inner {
    config: Config,
    backend: Arc<dyn CloudBackend>,
    optimizer: CostOptimizer,
    controller: VmLifecycleController,
    validator: IsolationValidator,
    cleanup: CleanupOrchestrator,
    audit: Arc<dyn AuditSink>,
    sessions: RwLock<HashMap<String, SharedSession>>,
}

/// Public handle; cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        backend: Arc<dyn CloudBackend>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                controller: VmLifecycleController::new(backend.clone(), config.clone()),
                validator: IsolationValidator::new(backend.clone(), config.clone()),
                cleanup: CleanupOrchestrator::new(backend.clone(), config.clone()),
                optimizer: CostOptimizer::new(),
                config,
                backend,
                audit,
                sessions: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Spawn the background loops: idle/TTL/budget sweep, scheduled orphan
    /// sweep, and the spot interruption listener. Called once at startup.
    pub fn start(&self) {
        tokio::spawn(sweep_loop(self.inner.clone()));
        tokio::spawn(orphan_sweep_loop(self.inner.clone()));
        tokio::spawn(interruption_loop(self.inner.clone()));
    }

    /// Create a session in `Pending` and drive it asynchronously through
    /// provisioning and validation. Rejects requests over the per-user
    /// session quota or the per-session resource ceiling.
    pub async fn create_session(&self, req: SessionRequest) -> Result<SessionSnapshot> {
        let cfg = &self.inner.config;
        if req.spec.vcpus > cfg.max_vcpus_per_session
            || req.spec.memory_gb > cfg.max_memory_gb_per_session
        {
            return Err(OrchestratorError::QuotaExceeded {
                user_id: req.user_id,
                reason: format!(
                    "requested {} vCPU / {} GiB exceeds the per-session ceiling of {} vCPU / {} GiB",
                    req.spec.vcpus,
                    req.spec.memory_gb,
                    cfg.max_vcpus_per_session,
                    cfg.max_memory_gb_per_session
                ),
            });
        }

        // The quota count and the insert happen under the same write lock
        // so two racing requests cannot both squeeze past the quota.
        let mut sessions = self.inner.sessions.write().await;
        let mut held = 0usize;
        for session in sessions.values() {
            let rec = session.lock().await;
            if rec.user_id == req.user_id && !rec.state.is_terminal() {
                held += 1;
            }
        }
        if held >= cfg.max_sessions_per_user {
            return Err(OrchestratorError::QuotaExceeded {
                user_id: req.user_id,
                reason: format!(
                    "user already holds {held} non-terminal session(s) (limit {})",
                    cfg.max_sessions_per_user
                ),
            });
        }

        let record = SessionRecord::new(&req, cfg.default_ttl, cfg.session_budget);
        let snapshot = record.snapshot();
        let session: SharedSession = Arc::new(Mutex::new(record));
        sessions.insert(snapshot.id.clone(), session.clone());
        drop(sessions);

        ACTIVE_SESSIONS.inc();
        info!(session_id = %snapshot.id, user_id = %req.user_id, "session created");
        tokio::spawn(drive(self.inner.clone(), session));
        Ok(snapshot)
    }

    /// Read-only snapshot. Terminated sessions stay visible for the audit
    /// retention window, then report `NotFound`.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let session = self.lookup(session_id).await?;
        let expired = {
            let rec = session.lock().await;
            match (rec.state, rec.terminated_at) {
                (SessionState::Terminated, Some(at))
                    if at.elapsed() > self.inner.config.audit_retention =>
                {
                    true
                }
                _ => return Ok(rec.snapshot()),
            }
        };
        if expired {
            self.inner.sessions.write().await.remove(session_id);
        }
        Err(OrchestratorError::NotFound {
            session_id: session_id.to_string(),
        })
    }

    pub async fn list_user_sessions(&self, user_id: &str) -> Vec<SessionSnapshot> {
        let sessions: Vec<SharedSession> =
            self.inner.sessions.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for session in sessions {
            let rec = session.lock().await;
            if rec.user_id == user_id {
                out.push(rec.snapshot());
            }
        }
        out
    }

    /// Record user activity; an Idle session becomes Active again.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let session = self.lookup(session_id).await?;
        let mut rec = session.lock().await;
        match rec.state {
            SessionState::Active => {
                rec.last_activity = Instant::now();
                Ok(())
            }
            SessionState::Idle => {
                rec.try_transition(&[SessionState::Idle], SessionState::Active)?;
                rec.last_activity = Instant::now();
                Ok(())
            }
            _ => Err(OrchestratorError::InvalidTransition {
                from: rec.state.as_str(),
                to: SessionState::Active.as_str(),
            }),
        }
    }

    /// Idempotent termination: a Terminating/Terminated session is a
    /// no-op success and never produces a second cleanup pipeline.
    pub async fn terminate_session(
        &self,
        session_id: &str,
        reason: TerminationReason,
    ) -> Result<()> {
        let session = self.lookup(session_id).await?;
        let drive_owns_cleanup = {
            let mut rec = session.lock().await;
            match rec.state {
                SessionState::Terminating | SessionState::Terminated => return Ok(()),
                // The drive task is mid-flight; it observes the CAS
                // failure once its in-flight attempt completes and hands
                // the fresh VM straight to cleanup.
                SessionState::Provisioning | SessionState::Validating => {
                    rec.termination = Some(reason);
                    rec.try_transition(
                        &[SessionState::Provisioning, SessionState::Validating],
                        SessionState::Terminating,
                    )?;
                    true
                }
                // The drive task's failure path is already tearing down.
                SessionState::Failed => true,
                SessionState::Pending => {
                    rec.termination = Some(reason);
                    rec.try_transition(&[SessionState::Pending], SessionState::Terminating)?;
                    false
                }
                SessionState::Active | SessionState::Idle | SessionState::Suspended => {
                    rec.termination = Some(reason);
                    false
                }
            }
        };
        if !drive_owns_cleanup {
            run_cleanup_and_finalize(&self.inner, &session, reason, CleanupTier::Reactive).await;
        }
        Ok(())
    }

    /// Pause the session's VM (billing stops). Only on backends that
    /// advertise the capability.
    pub async fn suspend_session(&self, session_id: &str) -> Result<()> {
        if !self.inner.backend.supports_suspend() {
            return Err(OrchestratorError::Unsupported {
                operation: "suspend",
            });
        }
        let session = self.lookup(session_id).await?;
        let mut rec = session.lock().await;
        let instance_id = match rec.vm.as_ref() {
            Some(vm) => vm.instance_id.clone(),
            None => {
                return Err(OrchestratorError::InvalidTransition {
                    from: rec.state.as_str(),
                    to: SessionState::Suspended.as_str(),
                })
            }
        };
        rec.try_transition(&[SessionState::Active], SessionState::Suspended)?;
        rec.fold_billing();
        if let Err(e) = self.inner.backend.suspend_instance(&instance_id).await {
            // Roll back: the VM is still running and billing.
            let _ = rec.try_transition(&[SessionState::Suspended], SessionState::Active);
            rec.start_billing();
            return Err(e.into());
        }
        info!(%session_id, "session suspended, billing paused");
        Ok(())
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        if !self.inner.backend.supports_suspend() {
            return Err(OrchestratorError::Unsupported { operation: "resume" });
        }
        let session = self.lookup(session_id).await?;
        let mut rec = session.lock().await;
        let instance_id = match (&rec.state, rec.vm.as_ref()) {
            (SessionState::Suspended, Some(vm)) => vm.instance_id.clone(),
            _ => {
                return Err(OrchestratorError::InvalidTransition {
                    from: rec.state.as_str(),
                    to: SessionState::Active.as_str(),
                })
            }
        };
        self.inner.backend.resume_instance(&instance_id).await?;
        rec.try_transition(&[SessionState::Suspended], SessionState::Active)?;
        rec.start_billing();
        rec.last_activity = Instant::now();
        info!(%session_id, "session resumed");
        Ok(())
    }

    /// Advisory right-sizing for a running session; never applied.
    pub async fn right_sizing_advice(
        &self,
        session_id: &str,
        avg_cpu_percent: f64,
    ) -> Result<Option<RightSizingAdvice>> {
        let session = self.lookup(session_id).await?;
        let rec = session.lock().await;
        Ok(rec.vm.as_ref().and_then(|vm| {
            self.inner
                .optimizer
                .right_size(&vm.instance_class, avg_cpu_percent)
        }))
    }

    async fn lookup(&self, session_id: &str) -> Result<SharedSession> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                session_id: session_id.to_string(),
            })
    }
}

/// Drive one session from Pending to Active (or into cleanup). Exactly
/// one drive task exists per session.
async fn drive(inner: Arc<Inner>, session: SharedSession) {
    let (session_id, user_id, spec) = {
        let mut rec = session.lock().await;
        if rec
            .try_transition(&[SessionState::Pending], SessionState::Provisioning)
            .is_err()
        {
            // Terminated before we ever started; nothing was provisioned.
            return;
        }
        (rec.id.clone(), rec.user_id.clone(), rec.spec)
    };

    let prefs = SpotPreferences {
        allow_spot: inner.config.allow_spot,
        interruption_threshold: inner.config.spot_interruption_threshold,
        max_hourly_cost: inner.config.max_hourly_cost,
    };
    let plan = match inner.optimizer.plan(spec, &prefs) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(%session_id, error = %e, "no viable provisioning plan");
            fail_and_terminate(&inner, &session, TerminationReason::ProvisioningFailed).await;
            return;
        }
    };

    let vm = match inner
        .controller
        .provision(&session_id, &user_id, spec, &plan)
        .await
    {
        Ok(vm) => vm,
        Err(e) => {
            warn!(%session_id, error = %e, "provisioning exhausted");
            fail_and_terminate(&inner, &session, TerminationReason::ProvisioningFailed).await;
            return;
        }
    };
    let instance_id = vm.instance_id.clone();

    {
        let mut rec = session.lock().await;
        rec.vm = Some(vm);
        if rec
            .try_transition(&[SessionState::Provisioning], SessionState::Validating)
            .is_err()
        {
            // Terminate arrived mid-provisioning; the fresh VM goes
            // straight to cleanup, never to the user.
            drop(rec);
            info!(%session_id, "terminated while provisioning, cleaning up fresh vm");
            run_cleanup_and_finalize(
                &inner,
                &session,
                TerminationReason::UserRequested,
                CleanupTier::Reactive,
            )
            .await;
            return;
        }
    }

    // Validate isolation; a round with only Unknowns gets one re-run
    // before it is treated as a violation.
    let mut report = match inner.validator.validate(&session_id, &instance_id).await {
        Ok(report) => report,
        Err(e) => {
            error!(%session_id, error = %e, "isolation validation errored");
            fail_and_terminate(&inner, &session, TerminationReason::IsolationViolation).await;
            return;
        }
    };
    if report.has_unknowns() && !report.has_violations() {
        debug!(%session_id, "isolation round had unknowns, re-validating once");
        if let Ok(again) = inner.validator.validate(&session_id, &instance_id).await {
            report = again;
        }
    }
    inner
        .audit
        .record(AuditEvent::from_isolation(&report, &user_id));
    if !report.is_clean() {
        warn!(
            %session_id,
            score = report.score,
            violations = ?report.violations,
            "isolation non-compliant, session never exposed"
        );
        fail_and_terminate(&inner, &session, TerminationReason::IsolationViolation).await;
        return;
    }

    {
        let mut rec = session.lock().await;
        if rec
            .try_transition(&[SessionState::Validating], SessionState::Active)
            .is_err()
        {
            drop(rec);
            run_cleanup_and_finalize(
                &inner,
                &session,
                TerminationReason::UserRequested,
                CleanupTier::Reactive,
            )
            .await;
            return;
        }
        rec.last_activity = Instant::now();
        rec.start_billing();
    }
    info!(%session_id, %instance_id, "session active");
    tokio::spawn(monitor_health(inner.clone(), session.clone()));
}

/// Route a session that failed for cause through `Failed` into cleanup.
async fn fail_and_terminate(
    inner: &Arc<Inner>,
    session: &SharedSession,
    reason: TerminationReason,
) {
    {
        let mut rec = session.lock().await;
        if rec.state.is_terminal() {
            return;
        }
        rec.termination.get_or_insert(reason);
        // Already-Terminating sessions skip the Failed edge; the cleanup
        // latch below still decides who runs the pipeline.
        let _ = rec.try_transition(
            &[
                SessionState::Provisioning,
                SessionState::Validating,
                SessionState::Active,
                SessionState::Idle,
            ],
            SessionState::Failed,
        );
    }
    run_cleanup_and_finalize(inner, session, reason, CleanupTier::Reactive).await;
}

/// Terminate a live session for `reason` unless teardown already owns it.
async fn terminate_for_cause(
    inner: &Arc<Inner>,
    session: &SharedSession,
    reason: TerminationReason,
    tier: CleanupTier,
) {
    {
        let mut rec = session.lock().await;
        if rec.state.is_terminal() || rec.cleanup_started {
            return;
        }
        rec.termination.get_or_insert(reason);
    }
    run_cleanup_and_finalize(inner, session, reason, tier).await;
}

/// Move the session into Terminating, run the cleanup pipeline on its VM
/// (if any), then finalize to Terminated. The `cleanup_started` latch
/// makes the pipeline run at most once per session no matter how many
/// actors converge here.
async fn run_cleanup_and_finalize(
    inner: &Arc<Inner>,
    session: &SharedSession,
    fallback_reason: TerminationReason,
    tier: CleanupTier,
) {
    let (session_id, reason, vm) = {
        let mut rec = session.lock().await;
        if rec.cleanup_started || rec.state.is_terminal() {
            return;
        }
        if rec.state != SessionState::Terminating {
            let from = rec.state;
            if rec
                .try_transition(&[from], SessionState::Terminating)
                .is_err()
            {
                return;
            }
        }
        rec.cleanup_started = true;
        let reason = *rec.termination.get_or_insert(fallback_reason);
        if let Some(vm) = rec.vm.as_mut() {
            vm.state = VmState::Terminating;
        }
        (rec.id.clone(), reason, rec.vm.clone())
    };

    inner.audit.record(AuditEvent::TerminationStarted {
        session_id: session_id.clone(),
        reason: reason.to_string(),
    });

    let report = match vm.as_ref() {
        Some(vm) => Some(inner.cleanup.run(&session_id, vm, tier).await),
        None => None,
    };
    if let Some(report) = &report {
        inner.audit.record(AuditEvent::CleanupFinished {
            session_id: session_id.clone(),
            complete: report.is_complete(),
            orphaned: report.orphaned.clone(),
        });
    }

    finalize(inner, session, vm.map(|v| v.hourly_rate)).await;
}

/// Final bookkeeping: freeze cost, mark Terminated, emit the cost record.
async fn finalize(inner: &Arc<Inner>, session: &SharedSession, hourly_rate: Option<f64>) {
    let mut rec = session.lock().await;
    rec.fold_billing();
    if let Some(vm) = rec.vm.as_mut() {
        vm.state = VmState::Terminated;
    }
    if rec
        .try_transition(&[SessionState::Terminating], SessionState::Terminated)
        .is_err()
    {
        return;
    }
    rec.terminated_at = Some(Instant::now());
    ACTIVE_SESSIONS.dec();
    inner.audit.record(AuditEvent::CostFinalized {
        session_id: rec.id.clone(),
        total: rec.current_cost(),
        hourly_rate: hourly_rate.unwrap_or(0.0),
    });
    info!(
        session_id = %rec.id,
        reason = ?rec.termination,
        cost = rec.current_cost(),
        "session terminated"
    );
}

/// Periodic health probing for one Active session. Ends when the session
/// leaves the probe-able states.
///
/// The record lock is taken only to read the handle and to write the
/// streak back, never across the probe itself: a slow backend must not
/// block terminate/touch/get on this session.
async fn monitor_health(inner: Arc<Inner>, session: SharedSession) {
    let mut ticker = interval(inner.config.health_check_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut vm = {
            let rec = session.lock().await;
            match rec.state {
                SessionState::Active | SessionState::Idle => match rec.vm.as_ref() {
                    Some(vm) => vm.clone(),
                    None => return,
                },
                // Suspended VMs are not probed; billing is paused anyway.
                SessionState::Suspended => continue,
                _ => return,
            }
        };

        let outcome = inner.controller.health_check(&mut vm).await;

        // Fold the streak back in, unless an interruption swapped the VM
        // out while the probe was in flight.
        let still_current = {
            let mut rec = session.lock().await;
            if rec.state.is_terminal() || rec.cleanup_started {
                return;
            }
            match rec.vm.as_mut() {
                Some(current) if current.instance_id == vm.instance_id => {
                    current.probe_failures = vm.probe_failures;
                    current.state = vm.state;
                    true
                }
                Some(_) => false,
                None => return,
            }
        };
        if let Err(e) = outcome {
            if still_current {
                warn!(error = %e, "session vm unhealthy, terminating");
                fail_and_terminate(&inner, &session, TerminationReason::HealthCheckFailed).await;
                return;
            }
        }
    }
}

/// Idle/TTL/budget sweep plus audit-window purge.
async fn sweep_loop(inner: Arc<Inner>) {
    let mut ticker = interval(inner.config.sweep_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sweep_once(&inner).await;
    }
}

async fn sweep_once(inner: &Arc<Inner>) {
    let sessions: Vec<(String, SharedSession)> = inner
        .sessions
        .read()
        .await
        .iter()
        .map(|(id, s)| (id.clone(), s.clone()))
        .collect();

    let mut purge = Vec::new();
    for (id, session) in sessions {
        let reason = {
            let mut rec = session.lock().await;
            match rec.state {
                SessionState::Active | SessionState::Idle => {
                    if rec.idle_for() > inner.config.idle_threshold {
                        // Traverse the Idle edge before reclamation so the
                        // state history stays on defined edges.
                        if rec.state == SessionState::Active {
                            let _ =
                                rec.try_transition(&[SessionState::Active], SessionState::Idle);
                        }
                        Some(TerminationReason::Idle)
                    } else if rec.age() > rec.ttl {
                        Some(TerminationReason::Expired)
                    } else if rec.budget.is_some_and(|limit| rec.current_cost() > limit) {
                        Some(TerminationReason::BudgetExceeded)
                    } else {
                        None
                    }
                }
                SessionState::Suspended => {
                    (rec.age() > rec.ttl).then_some(TerminationReason::Expired)
                }
                // Claim the edge under the lock so the drive task cannot
                // start provisioning after the expiry decision.
                SessionState::Pending if rec.age() > rec.ttl => {
                    rec.termination.get_or_insert(TerminationReason::Expired);
                    rec.try_transition(&[SessionState::Pending], SessionState::Terminating)
                        .ok()
                        .map(|_| TerminationReason::Expired)
                }
                // Backstop for a session stalled before activation: flag
                // it expired and flip to Terminating; the drive task
                // observes the CAS failure and hands its in-flight VM to
                // cleanup.
                SessionState::Provisioning | SessionState::Validating => {
                    if rec.age() > rec.ttl {
                        rec.termination.get_or_insert(TerminationReason::Expired);
                        let from = rec.state;
                        if rec
                            .try_transition(&[from], SessionState::Terminating)
                            .is_ok()
                        {
                            info!(session_id = %id, "sweep expiring session stalled before activation");
                            SWEEP_TERMINATIONS.inc();
                        }
                    }
                    None
                }
                SessionState::Terminated => {
                    if rec
                        .terminated_at
                        .is_some_and(|at| at.elapsed() > inner.config.audit_retention)
                    {
                        purge.push(id.clone());
                    }
                    None
                }
                _ => None,
            }
        };
        if let Some(reason) = reason {
            info!(session_id = %id, %reason, "sweep reclaiming session");
            SWEEP_TERMINATIONS.inc();
            terminate_for_cause(inner, &session, reason, CleanupTier::Reactive).await;
        }
    }

    if !purge.is_empty() {
        let mut map = inner.sessions.write().await;
        for id in purge {
            map.remove(&id);
        }
    }
}

/// Scheduled orphan sweep: reconcile backend inventory against the
/// registry (live sessions plus the audit retention window).
async fn orphan_sweep_loop(inner: Arc<Inner>) {
    let mut ticker = interval(inner.config.orphan_sweep_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let known: HashSet<String> = inner.sessions.read().await.keys().cloned().collect();
        match inner.cleanup.sweep_orphans(&known).await {
            Ok(orphans) => {
                for orphan in orphans {
                    inner.audit.record(AuditEvent::OrphanReclaimed {
                        kind: orphan.kind,
                        resource_id: orphan.id,
                    });
                }
            }
            Err(e) => warn!(error = %e, "orphan sweep could not list backend inventory"),
        }
    }
}

/// Spot interruption listener: one subscription for the whole manager,
/// one handler task per warning.
async fn interruption_loop(inner: Arc<Inner>) {
    let mut rx = inner.backend.subscribe_interruptions();
    loop {
        match rx.recv().await {
            Ok(warning) => {
                SPOT_INTERRUPTIONS.inc();
                let Some(session) = find_by_instance(&inner, &warning.instance_id).await else {
                    debug!(instance_id = %warning.instance_id, "interruption for unknown instance");
                    continue;
                };
                tokio::spawn(handle_interruption(
                    inner.clone(),
                    session,
                    warning.instance_id,
                ));
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "interruption listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn find_by_instance(inner: &Arc<Inner>, instance_id: &str) -> Option<SharedSession> {
    let sessions: Vec<SharedSession> = inner.sessions.read().await.values().cloned().collect();
    for session in sessions {
        let rec = session.lock().await;
        if rec
            .vm
            .as_ref()
            .is_some_and(|vm| vm.instance_id == instance_id)
            && !rec.state.is_terminal()
        {
            drop(rec);
            return Some(session);
        }
    }
    None
}

/// Race the interruption grace window: an on-demand replacement that
/// arrives in time swaps in transparently; otherwise the session is
/// reclaimed.
async fn handle_interruption(inner: Arc<Inner>, session: SharedSession, instance_id: String) {
    let (session_id, user_id, spec, old) = {
        let rec = session.lock().await;
        if !matches!(
            rec.state,
            SessionState::Active | SessionState::Idle | SessionState::Suspended
        ) {
            return;
        }
        let Some(vm) = rec.vm.as_ref().filter(|vm| vm.instance_id == instance_id) else {
            return;
        };
        (rec.id.clone(), rec.user_id.clone(), rec.spec, vm.clone())
    };
    info!(
        %session_id,
        %instance_id,
        grace = ?inner.config.spot_interruption_grace,
        "spot interruption warning, racing on-demand replacement"
    );

    let prefs = SpotPreferences {
        allow_spot: false,
        interruption_threshold: inner.config.spot_interruption_threshold,
        max_hourly_cost: inner.config.max_hourly_cost,
    };
    let replacement = match inner.optimizer.plan(spec, &prefs) {
        Ok(plan) => {
            timeout(
                inner.config.spot_interruption_grace,
                inner
                    .controller
                    .provision_replacement(&session_id, &user_id, spec, &plan),
            )
            .await
        }
        Err(e) => Ok(Err(e)),
    };

    match replacement {
        Ok(Ok(new_vm)) => {
            {
                let mut rec = session.lock().await;
                if matches!(
                    rec.state,
                    SessionState::Terminating | SessionState::Terminated
                ) {
                    // Session died while we raced; the replacement must
                    // not leak.
                    drop(rec);
                    let _ = inner.controller.destroy(&new_vm.instance_id, true).await;
                    let _ = inner
                        .backend
                        .reclaim_storage(&new_vm.storage_handle, true)
                        .await;
                    let _ = inner
                        .backend
                        .reclaim_network(&new_vm.network_handle, true)
                        .await;
                    return;
                }
                rec.fold_billing();
                rec.vm = Some(new_vm.clone());
                rec.start_billing();
            }
            info!(
                %session_id,
                old_instance = %old.instance_id,
                new_instance = %new_vm.instance_id,
                "replacement provisioned within grace, session continues"
            );
            // Tear down the interrupted VM's resources; the provider will
            // reclaim the instance itself shortly anyway.
            let _ = inner.controller.destroy(&old.instance_id, true).await;
            let _ = inner
                .backend
                .sanitize_storage(&old.storage_handle, true)
                .await;
            let _ = inner
                .backend
                .reclaim_storage(&old.storage_handle, true)
                .await;
            let _ = inner
                .backend
                .reclaim_network(&old.network_handle, true)
                .await;
        }
        Ok(Err(e)) => {
            warn!(%session_id, error = %e, "replacement provisioning failed, reclaiming session");
            terminate_for_cause(
                &inner,
                &session,
                TerminationReason::SpotReclaimed,
                CleanupTier::Reactive,
            )
            .await;
        }
        Err(_) => {
            warn!(
                %session_id,
                grace = ?inner.config.spot_interruption_grace,
                "replacement missed the grace window, reclaiming session"
            );
            terminate_for_cause(
                &inner,
                &session,
                TerminationReason::SpotReclaimed,
                CleanupTier::Reactive,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::backend::SimBackend;
    use crate::cost::ResourceSpec;

    fn manager(backend: Arc<SimBackend>, config: Config) -> SessionManager {
        SessionManager::new(
            config,
            backend as Arc<dyn CloudBackend>,
            Arc::new(MemoryAuditSink::new()),
        )
        .unwrap()
    }

    async fn wait_for_state(
        mgr: &SessionManager,
        id: &str,
        want: SessionState,
    ) -> SessionSnapshot {
        for _ in 0..200 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            let snap = mgr.get_session(id).await.unwrap();
            if snap.state == want {
                return snap;
            }
        }
        panic!("session never reached {want}");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_spec_is_rejected_with_quota_error() {
        let mgr = manager(Arc::new(SimBackend::new()), Config::default());
        let mut req = SessionRequest::new("user-a");
        req.spec = ResourceSpec {
            vcpus: 64,
            memory_gb: 256,
            disk_gb: 100,
        };
        assert!(matches!(
            mgr.create_session(req).await,
            Err(OrchestratorError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn second_session_for_same_user_hits_the_quota() {
        let mgr = manager(Arc::new(SimBackend::new()), Config::default());
        mgr.create_session(SessionRequest::new("user-a"))
            .await
            .unwrap();
        let err = mgr
            .create_session(SessionRequest::new("user-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QuotaExceeded { .. }));
        // A different user is unaffected.
        assert!(mgr.create_session(SessionRequest::new("user-b")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn session_reaches_active_on_a_clean_backend() {
        let backend = Arc::new(SimBackend::new());
        let mgr = manager(backend, Config::default());
        let snap = mgr
            .create_session(SessionRequest::new("user-a"))
            .await
            .unwrap();
        assert_eq!(snap.state, SessionState::Pending);

        let active = wait_for_state(&mgr, &snap.id, SessionState::Active).await;
        assert!(active.endpoint.is_some());
        assert!(active.instance_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_on_incapable_backend_is_unsupported() {
        let backend = Arc::new(SimBackend::new());
        let mgr = manager(backend, Config::default());
        let snap = mgr
            .create_session(SessionRequest::new("user-a"))
            .await
            .unwrap();
        wait_for_state(&mgr, &snap.id, SessionState::Active).await;
        assert!(matches!(
            mgr.suspend_session(&snap.id).await,
            Err(OrchestratorError::Unsupported { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_and_resume_on_capable_backend() {
        let backend = Arc::new(SimBackend::new().suspend_capable());
        let mgr = manager(backend, Config::default());
        let snap = mgr
            .create_session(SessionRequest::new("user-a"))
            .await
            .unwrap();
        wait_for_state(&mgr, &snap.id, SessionState::Active).await;

        mgr.suspend_session(&snap.id).await.unwrap();
        let suspended = mgr.get_session(&snap.id).await.unwrap();
        assert_eq!(suspended.state, SessionState::Suspended);
        let frozen = suspended.cost;

        // Billing stays flat while suspended.
        tokio::time::sleep(tokio::time::Duration::from_secs(3600)).await;
        let later = mgr.get_session(&snap.id).await.unwrap();
        assert!((later.cost - frozen).abs() < 1e-12);

        mgr.resume_session(&snap.id).await.unwrap();
        assert_eq!(
            mgr.get_session(&snap.id).await.unwrap().state,
            SessionState::Active
        );
    }
}

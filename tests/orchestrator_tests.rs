//! Integration tests for the session lifecycle
//!
//! These tests drive full sessions against the simulated backend under
//! paused tokio time, so multi-hour scenarios (TTL expiry, budget burn,
//! interruption grace races) run in microseconds of wall clock.

use std::sync::Arc;

use tokio::time::{sleep, timeout, Duration};

use deskvisor::audit::{AuditEvent, MemoryAuditSink};
use deskvisor::backend::{sim::SimLatency, IsolationLayer, ResourceKind, SimBackend};
use deskvisor::cost::{CapacityType, ResourceSpec};
use deskvisor::session::{SessionManager, SessionRequest, SessionState, TerminationReason};
use deskvisor::{Config, OrchestratorError};

fn manager_with(
    backend: Arc<SimBackend>,
    config: Config,
) -> (SessionManager, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = SessionManager::new(config, backend, audit.clone()).unwrap();
    (manager, audit)
}

async fn wait_for(
    manager: &SessionManager,
    session_id: &str,
    want: SessionState,
) -> deskvisor::SessionSnapshot {
    for _ in 0..1000 {
        sleep(Duration::from_millis(200)).await;
        let snap = manager.get_session(session_id).await.unwrap();
        if snap.state == want {
            return snap;
        }
    }
    panic!("session never reached {want}");
}

/// Lifecycle states are only ever observed in forward order; a session
/// starts Pending and no snapshot ever shows a backward jump.
#[tokio::test(start_paused = true)]
async fn states_advance_monotonically_to_active() {
    let (manager, _) = manager_with(Arc::new(SimBackend::new()), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    assert_eq!(created.state, SessionState::Pending);

    fn rank(state: SessionState) -> u8 {
        match state {
            SessionState::Pending => 0,
            SessionState::Provisioning => 1,
            SessionState::Validating => 2,
            SessionState::Active => 3,
            other => panic!("unexpected state on the happy path: {other}"),
        }
    }

    let mut last = rank(created.state);
    loop {
        sleep(Duration::from_millis(10)).await;
        let snap = manager.get_session(&created.id).await.unwrap();
        let now = rank(snap.state);
        assert!(now >= last, "state went backwards");
        last = now;
        if snap.state == SessionState::Active {
            break;
        }
    }
}

/// A session is never exposed while isolation is non-compliant: any
/// single-layer violation keeps it from Active and destroys the VM.
#[tokio::test(start_paused = true)]
async fn isolation_violation_blocks_activation_and_destroys_the_vm() {
    for layer in IsolationLayer::ALL {
        let backend = Arc::new(SimBackend::new());
        backend.inject_violation(layer, "co-residency detected");
        let (manager, audit) = manager_with(backend.clone(), Config::default());

        let created = manager
            .create_session(SessionRequest::new("user-a"))
            .await
            .unwrap();
        let terminated = wait_for(&manager, &created.id, SessionState::Terminated).await;

        assert_eq!(
            terminated.termination,
            Some(TerminationReason::IsolationViolation)
        );
        assert_eq!(backend.instance_count(), 0, "{layer} violation leaked a vm");
        assert!(audit
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::IsolationRejected { .. })));
    }
}

/// Terminating twice is a no-op success and produces exactly one cleanup
/// pipeline (one TerminationStarted, one CleanupFinished).
#[tokio::test(start_paused = true)]
async fn terminate_is_idempotent_with_a_single_cleanup() {
    let backend = Arc::new(SimBackend::new());
    let (manager, audit) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;

    manager
        .terminate_session(&created.id, TerminationReason::UserRequested)
        .await
        .unwrap();
    manager
        .terminate_session(&created.id, TerminationReason::UserRequested)
        .await
        .unwrap();

    let snap = manager.get_session(&created.id).await.unwrap();
    assert_eq!(snap.state, SessionState::Terminated);

    let events = audit.events();
    let starts = events
        .iter()
        .filter(|e| matches!(e, AuditEvent::TerminationStarted { .. }))
        .count();
    let finishes = events
        .iter()
        .filter(|e| matches!(e, AuditEvent::CleanupFinished { .. }))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(finishes, 1);
}

/// A completed cleanup implies zero residual backend resources for the
/// session: the audit event reports complete and the inventory is empty.
#[tokio::test(start_paused = true)]
async fn completed_cleanup_leaves_no_backend_residuals() {
    let backend = Arc::new(SimBackend::new());
    let (manager, audit) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;

    manager
        .terminate_session(&created.id, TerminationReason::UserRequested)
        .await
        .unwrap();

    let complete = audit.events().iter().any(|e| {
        matches!(
            e,
            AuditEvent::CleanupFinished { complete: true, orphaned, .. } if orphaned.is_empty()
        )
    });
    assert!(complete, "cleanup did not report complete");
    assert_eq!(backend.instance_count(), 0);
}

/// Terminate called mid-provisioning hands the fresh VM straight to
/// cleanup instead of exposing it.
#[tokio::test(start_paused = true)]
async fn terminate_while_provisioning_cleans_up_the_fresh_vm() {
    let backend = Arc::new(SimBackend::with_latency(SimLatency {
        spot_provision: Duration::from_secs(30),
        on_demand_provision: Duration::from_secs(30),
        ..SimLatency::default()
    }));
    let (manager, _) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();

    // Let the drive task get into its provisioning attempt, then pull the
    // plug while the attempt is in flight.
    sleep(Duration::from_secs(5)).await;
    assert_eq!(
        manager.get_session(&created.id).await.unwrap().state,
        SessionState::Provisioning
    );
    manager
        .terminate_session(&created.id, TerminationReason::UserRequested)
        .await
        .unwrap();

    let terminated = wait_for(&manager, &created.id, SessionState::Terminated).await;
    assert_eq!(terminated.state, SessionState::Terminated);
    assert_eq!(backend.instance_count(), 0, "in-flight vm leaked");
}

/// Idle sweep boundary: a session idle one second past the threshold is
/// reclaimed with reason Idle on the next tick; a freshly-active one is
/// untouched.
#[tokio::test(start_paused = true)]
async fn idle_sweep_reclaims_past_threshold_only() {
    let backend = Arc::new(SimBackend::new());
    let config = Config::default();
    let idle_threshold = config.idle_threshold;
    let (manager, _) = manager_with(backend, config);
    manager.start();

    let stale = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &stale.id, SessionState::Active).await;

    // Cross the threshold by one second and give the sweep a tick.
    sleep(idle_threshold + Duration::from_secs(1)).await;
    let reclaimed = wait_for(&manager, &stale.id, SessionState::Terminated).await;
    assert_eq!(reclaimed.termination, Some(TerminationReason::Idle));

    // A just-touched session survives the same sweep ticks.
    let fresh = manager
        .create_session(SessionRequest::new("user-b"))
        .await
        .unwrap();
    wait_for(&manager, &fresh.id, SessionState::Active).await;
    sleep(Duration::from_secs(120)).await;
    let snap = manager.get_session(&fresh.id).await.unwrap();
    assert_eq!(snap.state, SessionState::Active);
}

/// Cost accounting is monotone while the session lives and freezes at
/// Terminated.
#[tokio::test(start_paused = true)]
async fn cost_is_monotone_and_freezes_at_termination() {
    let backend = Arc::new(SimBackend::new());
    let (manager, _) = manager_with(backend, Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;

    let mut last = 0.0_f64;
    for _ in 0..5 {
        sleep(Duration::from_secs(120)).await;
        manager.touch(&created.id).await.unwrap();
        let cost = manager.get_session(&created.id).await.unwrap().cost;
        assert!(cost >= last, "cost decreased");
        last = cost;
    }
    assert!(last > 0.0);

    manager
        .terminate_session(&created.id, TerminationReason::UserRequested)
        .await
        .unwrap();
    let frozen = manager.get_session(&created.id).await.unwrap().cost;
    sleep(Duration::from_secs(600)).await;
    let later = manager.get_session(&created.id).await.unwrap().cost;
    assert!((later - frozen).abs() < 1e-12, "cost changed after Terminated");
}

/// Spot capacity dries up twice; the third candidate (on-demand) carries
/// the session to Active.
#[tokio::test(start_paused = true)]
async fn spot_drought_falls_back_to_on_demand_session() {
    let backend = Arc::new(SimBackend::new());
    backend.fail_next("provision_spot", 2);
    let (manager, _) = manager_with(backend, Config::default());

    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    let active = wait_for(&manager, &created.id, SessionState::Active).await;
    assert_eq!(active.capacity, Some(CapacityType::OnDemand));
}

/// A tight budget kills the session well before its TTL.
#[tokio::test(start_paused = true)]
async fn budget_exceeded_terminates_before_ttl() {
    let backend = Arc::new(SimBackend::new());
    let config = Config {
        // Keep the idle sweep out of the way; this test is about spend.
        idle_threshold: Duration::from_secs(6 * 3600),
        ..Config::default()
    };
    let (manager, _) = manager_with(backend, config);
    manager.start();

    // A 2xlarge-class spec burns roughly $0.09/h on spot; $0.05 is gone
    // in just over half an hour, far inside the 1h TTL.
    let mut req = SessionRequest::new("user-a");
    req.spec = ResourceSpec {
        vcpus: 8,
        memory_gb: 32,
        disk_gb: 100,
    };
    req.ttl = Some(Duration::from_secs(3600));
    req.budget = Some(0.05);
    let created = manager.create_session(req).await.unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;

    sleep(Duration::from_secs(45 * 60)).await;
    let snap = manager.get_session(&created.id).await.unwrap();
    assert_eq!(snap.state, SessionState::Terminated);
    assert_eq!(snap.termination, Some(TerminationReason::BudgetExceeded));
    assert!(snap.cost > 0.05);
}

fn grace_race_config() -> Config {
    Config {
        // The replacement attempt itself must be allowed to run longer
        // than the grace window so the window is what decides the race.
        provision_attempt_timeout: Duration::from_secs(300),
        ..Config::default()
    }
}

fn latency(on_demand: Duration) -> SimLatency {
    SimLatency {
        on_demand_provision: on_demand,
        ..SimLatency::default()
    }
}

/// Interruption with a 120s grace window: a replacement arriving at 90s
/// swaps in and the session stays Active on a new on-demand VM.
#[tokio::test(start_paused = true)]
async fn interruption_replacement_inside_grace_keeps_session_active() {
    let backend = Arc::new(SimBackend::with_latency(latency(Duration::from_secs(90))));
    let (manager, _) = manager_with(backend.clone(), grace_race_config());
    manager.start();

    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    let active = wait_for(&manager, &created.id, SessionState::Active).await;
    assert_eq!(active.capacity, Some(CapacityType::Spot));
    let old_instance = active.instance_id.clone().unwrap();

    backend.inject_interruption(&old_instance);
    sleep(Duration::from_secs(180)).await;

    let snap = manager.get_session(&created.id).await.unwrap();
    assert_eq!(snap.state, SessionState::Active);
    assert_eq!(snap.capacity, Some(CapacityType::OnDemand));
    assert_ne!(snap.instance_id.unwrap(), old_instance);
}

/// Same race, but the replacement needs 150s: the grace window expires
/// and the session is reclaimed with SpotReclaimed.
#[tokio::test(start_paused = true)]
async fn interruption_replacement_past_grace_reclaims_session() {
    let backend = Arc::new(SimBackend::with_latency(latency(Duration::from_secs(150))));
    let (manager, _) = manager_with(backend.clone(), grace_race_config());
    manager.start();

    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    let active = wait_for(&manager, &created.id, SessionState::Active).await;
    assert_eq!(active.capacity, Some(CapacityType::Spot));
    backend.inject_interruption(&active.instance_id.unwrap());

    sleep(Duration::from_secs(300)).await;
    let snap = manager.get_session(&created.id).await.unwrap();
    assert_eq!(snap.state, SessionState::Terminated);
    assert_eq!(snap.termination, Some(TerminationReason::SpotReclaimed));
    assert_eq!(backend.instance_count(), 0);
}

/// The scheduled orphan sweep reclaims backend resources with no owning
/// session and emits an audit alert for each.
#[tokio::test(start_paused = true)]
async fn orphan_sweep_reclaims_unowned_resources() {
    let backend = Arc::new(SimBackend::new());
    backend.seed_orphan(ResourceKind::Volume, "vol-leaked");
    backend.seed_orphan(ResourceKind::NetworkSegment, "seg-leaked");
    let config = Config::default();
    let sweep_interval = config.orphan_sweep_interval;
    let (manager, audit) = manager_with(backend, config);
    manager.start();

    sleep(sweep_interval + Duration::from_secs(5)).await;

    let reclaimed: Vec<String> = audit
        .events()
        .iter()
        .filter_map(|e| match e {
            AuditEvent::OrphanReclaimed { resource_id, .. } => Some(resource_id.clone()),
            _ => None,
        })
        .collect();
    assert!(reclaimed.contains(&"vol-leaked".to_string()));
    assert!(reclaimed.contains(&"seg-leaked".to_string()));
}

/// Consecutive probe failures push the session through Failed into a full
/// cleanup with reason HealthCheckFailed.
#[tokio::test(start_paused = true)]
async fn unhealthy_vm_fails_the_session() {
    let backend = Arc::new(SimBackend::new());
    let (manager, _) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    let active = wait_for(&manager, &created.id, SessionState::Active).await;

    backend.set_instance_health(&active.instance_id.unwrap(), false);
    let terminated = wait_for(&manager, &created.id, SessionState::Terminated).await;
    assert_eq!(
        terminated.termination,
        Some(TerminationReason::HealthCheckFailed)
    );
    assert_eq!(backend.instance_count(), 0);
}

/// A backend whose health probes never answer must not wedge the session:
/// each probe expires on the probe timeout, counts as a failure, and the
/// threshold terminates the session with HealthCheckFailed.
#[tokio::test(start_paused = true)]
async fn unanswered_health_checks_terminate_the_session() {
    let backend = Arc::new(SimBackend::with_latency(SimLatency {
        probe: Duration::from_secs(24 * 3600),
        ..SimLatency::default()
    }));
    let (manager, _) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;

    let terminated = wait_for(&manager, &created.id, SessionState::Terminated).await;
    assert_eq!(
        terminated.termination,
        Some(TerminationReason::HealthCheckFailed)
    );
    assert_eq!(backend.instance_count(), 0);
}

/// Explicit terminate must complete even while a health probe is still
/// outstanding: the monitor never holds the session lock across the probe.
#[tokio::test(start_paused = true)]
async fn terminate_completes_while_a_health_check_is_outstanding() {
    let backend = Arc::new(SimBackend::with_latency(SimLatency {
        probe: Duration::from_secs(24 * 3600),
        ..SimLatency::default()
    }));
    let (manager, _) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;

    // One monitor tick has fired and its probe is hanging.
    sleep(Duration::from_secs(20)).await;
    let result = timeout(
        Duration::from_secs(600),
        manager.terminate_session(&created.id, TerminationReason::UserRequested),
    )
    .await;
    assert!(result.is_ok(), "terminate blocked behind a hung probe");
    result.unwrap().unwrap();

    let snap = manager.get_session(&created.id).await.unwrap();
    assert_eq!(snap.state, SessionState::Terminated);
    assert_eq!(snap.termination, Some(TerminationReason::UserRequested));
    assert_eq!(backend.instance_count(), 0);
}

/// Teardown calls that never answer still produce a bounded termination:
/// every phase times out and escalates, the session reaches Terminated,
/// and the leftovers are flagged for the orphan sweep.
#[tokio::test(start_paused = true)]
async fn stalled_teardown_cannot_wedge_termination() {
    let backend = Arc::new(SimBackend::with_latency(SimLatency {
        teardown_op: Duration::from_secs(24 * 3600),
        ..SimLatency::default()
    }));
    let (manager, audit) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;

    let result = timeout(
        Duration::from_secs(6 * 3600),
        manager.terminate_session(&created.id, TerminationReason::UserRequested),
    )
    .await;
    assert!(result.is_ok(), "terminate stalled on unanswered teardown");
    result.unwrap().unwrap();

    let snap = manager.get_session(&created.id).await.unwrap();
    assert_eq!(snap.state, SessionState::Terminated);
    let flagged = audit.events().iter().any(|e| {
        matches!(
            e,
            AuditEvent::CleanupFinished { complete: false, orphaned, .. } if !orphaned.is_empty()
        )
    });
    assert!(flagged, "incomplete cleanup was not flagged for the sweep");
}

/// An inspector that never answers fails validation with Unknowns instead
/// of stranding the session in Validating.
#[tokio::test(start_paused = true)]
async fn unanswerable_isolation_checks_fail_the_session() {
    let backend = Arc::new(SimBackend::with_latency(SimLatency {
        inspect: Duration::from_secs(24 * 3600),
        ..SimLatency::default()
    }));
    let (manager, _) = manager_with(backend.clone(), Config::default());
    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();

    let terminated = wait_for(&manager, &created.id, SessionState::Terminated).await;
    assert_eq!(
        terminated.termination,
        Some(TerminationReason::IsolationViolation)
    );
    assert_eq!(backend.instance_count(), 0);
}

/// The TTL sweep backstops a session stalled before activation: a
/// provisioning attempt that outlives the TTL is expired by the sweep and
/// the eventually-arriving VM goes straight to cleanup.
#[tokio::test(start_paused = true)]
async fn ttl_backstop_expires_a_session_stuck_before_activation() {
    let backend = Arc::new(SimBackend::with_latency(SimLatency {
        spot_provision: Duration::from_secs(5 * 3600),
        on_demand_provision: Duration::from_secs(5 * 3600),
        ..SimLatency::default()
    }));
    let config = Config {
        provision_attempt_timeout: Duration::from_secs(10 * 3600),
        ..Config::default()
    };
    let (manager, _) = manager_with(backend.clone(), config);
    manager.start();

    let mut req = SessionRequest::new("user-a");
    req.ttl = Some(Duration::from_secs(1800));
    let created = manager.create_session(req).await.unwrap();

    // The sweep expires the session at ~30min; the provisioning attempt
    // lands hours later and must be torn down, not exposed.
    let mut snap = manager.get_session(&created.id).await.unwrap();
    for _ in 0..400 {
        sleep(Duration::from_secs(60)).await;
        snap = manager.get_session(&created.id).await.unwrap();
        if snap.state == SessionState::Terminated {
            break;
        }
    }
    assert_eq!(snap.state, SessionState::Terminated);
    assert_eq!(snap.termination, Some(TerminationReason::Expired));
    assert_eq!(backend.instance_count(), 0, "late-arriving vm leaked");
}

/// Terminated sessions stay visible for the audit window, then report
/// NotFound.
#[tokio::test(start_paused = true)]
async fn terminated_sessions_age_out_of_the_registry() {
    let backend = Arc::new(SimBackend::new());
    let config = Config::default();
    let retention = config.audit_retention;
    let (manager, _) = manager_with(backend, config);

    let created = manager
        .create_session(SessionRequest::new("user-a"))
        .await
        .unwrap();
    wait_for(&manager, &created.id, SessionState::Active).await;
    manager
        .terminate_session(&created.id, TerminationReason::UserRequested)
        .await
        .unwrap();

    // Still visible inside the window.
    assert!(manager.get_session(&created.id).await.is_ok());

    sleep(retention + Duration::from_secs(1)).await;
    assert!(matches!(
        manager.get_session(&created.id).await,
        Err(OrchestratorError::NotFound { .. })
    ));
}

//! Prometheus metrics for orchestrator observability
//!
//! Global registry of gauges, counters and histograms covering the session
//! lifecycle, provisioning latency, cleanup escalation and leaked-cost
//! backstops. Scraping/export is the embedding service's concern.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

lazy_static! {
    /// Sessions currently in a non-terminal state.
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "deskvisor_active_sessions",
        "Number of sessions in a non-terminal state"
    )
    .unwrap();

    /// VMs currently provisioned and not yet confirmed destroyed.
    pub static ref LIVE_VMS: IntGauge = register_int_gauge!(
        "deskvisor_live_vms",
        "Number of VMs provisioned and not yet confirmed destroyed"
    )
    .unwrap();

    /// End-to-end provisioning duration, including capacity fallbacks.
    pub static ref PROVISION_DURATION: Histogram = register_histogram!(
        "deskvisor_provision_duration_seconds",
        "Time from provisioning start to a running VM",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap();

    /// Full cleanup pipeline duration per session.
    pub static ref CLEANUP_DURATION: Histogram = register_histogram!(
        "deskvisor_cleanup_duration_seconds",
        "Time from Terminating to audited Terminated",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap();

    /// Spot attempts that fell through to another capacity candidate.
    pub static ref CAPACITY_FALLBACKS: IntCounter = register_int_counter!(
        "deskvisor_capacity_fallbacks_total",
        "Provisioning attempts that fell back to the next capacity candidate"
    )
    .unwrap();

    /// Spot interruption warnings received.
    pub static ref SPOT_INTERRUPTIONS: IntCounter = register_int_counter!(
        "deskvisor_spot_interruptions_total",
        "Spot interruption warnings received"
    )
    .unwrap();

    /// Cleanup operations that escalated past the primary rung.
    pub static ref CLEANUP_ESCALATIONS: IntCounter = register_int_counter!(
        "deskvisor_cleanup_escalations_total",
        "Cleanup operations escalated past the primary retry rung"
    )
    .unwrap();

    /// Resources flagged OrphanedSuspected or found by the orphan sweep.
    pub static ref ORPHANS_DETECTED: IntCounter = register_int_counter!(
        "deskvisor_orphans_detected_total",
        "Backend resources with no live or recently-terminated session"
    )
    .unwrap();

    /// Sessions terminated by the idle/TTL sweep.
    pub static ref SWEEP_TERMINATIONS: IntCounter = register_int_counter!(
        "deskvisor_sweep_terminations_total",
        "Sessions terminated by the idle/TTL/budget sweep"
    )
    .unwrap();
}

//! VM Handle - represents a single provisioned VM with all its resources
//!
//! A handle exists only once the backend has confirmed the instance
//! running; it then tracks the VM through
//! Running -> (Unhealthy) -> Terminating -> Terminated

use serde::Serialize;
use tokio::time::Instant;

use crate::backend::{ConnectionEndpoint, HealthReport, ProvisionedInstance};
use crate::cost::CapacityType;

/// Lifecycle of one VM, independent of the owning session's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Booted and reachable
    Running,
    /// Failed the consecutive-probe threshold; pending termination
    Unhealthy,
    /// Teardown in progress
    Terminating,
    /// Backend confirmed the instance is gone
    Terminated,
}

/// Represents a single provisioned VM. Owned by exactly one session
/// record; replaced wholesale when a spot interruption forces
/// re-provisioning onto on-demand capacity.
#[derive(Debug, Clone)]
pub struct VmHandle {
    /// Backend instance identifier (e.g. "i-0000002a")
    pub instance_id: String,
    /// Spot or on-demand
    pub capacity: CapacityType,
    pub instance_class: String,
    /// Effective hourly rate this VM accrues cost at
    pub hourly_rate: f64,
    /// Actual spot price at launch; None for on-demand
    pub spot_price: Option<f64>,
    /// Remote-display endpoint handed to the session owner
    pub endpoint: ConnectionEndpoint,
    /// Opaque teardown handles
    pub storage_handle: String,
    pub network_handle: String,
    pub state: VmState,
    /// When the backend confirmed the instance running
    pub provisioned_at: Instant,
    /// Consecutive failed probes; reset by any healthy probe
    pub probe_failures: u32,
}

impl VmHandle {
    pub fn from_provisioned(instance: ProvisionedInstance, hourly_rate: f64) -> Self {
        Self {
            instance_id: instance.instance_id,
            capacity: instance.capacity,
            instance_class: instance.instance_class,
            hourly_rate,
            spot_price: instance.spot_price,
            endpoint: instance.endpoint,
            storage_handle: instance.storage_handle,
            network_handle: instance.network_handle,
            state: VmState::Running,
            provisioned_at: Instant::now(),
            probe_failures: 0,
        }
    }

    /// Fold one probe result into the failure streak. Returns the new
    /// consecutive-failure count (0 when healthy). A single healthy probe
    /// recovers an Unhealthy VM.
    pub fn record_probe(&mut self, report: &HealthReport) -> u32 {
        if report.is_healthy() {
            self.probe_failures = 0;
            if self.state == VmState::Unhealthy {
                self.state = VmState::Running;
            }
        } else {
            self.probe_failures += 1;
        }
        self.probe_failures
    }

    pub fn is_spot(&self) -> bool {
        self.capacity == CapacityType::Spot
    }

    /// Time since the backend confirmed the instance running.
    pub fn age(&self) -> tokio::time::Duration {
        self.provisioned_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> VmHandle {
        VmHandle {
            instance_id: "i-test".into(),
            capacity: CapacityType::Spot,
            instance_class: "t3.medium".into(),
            hourly_rate: 0.0125,
            spot_price: Some(0.0125),
            endpoint: ConnectionEndpoint {
                host: "10.0.0.1".into(),
                port: 3389,
                credential_ref: "secret/s/rdp".into(),
            },
            storage_handle: "vol-test".into(),
            network_handle: "seg-test".into(),
            state: VmState::Running,
            provisioned_at: Instant::now(),
            probe_failures: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_instance_starts_running() {
        let vm = VmHandle::from_provisioned(
            ProvisionedInstance {
                instance_id: "i-fresh".into(),
                capacity: CapacityType::Spot,
                instance_class: "t3.medium".into(),
                spot_price: Some(0.0125),
                endpoint: ConnectionEndpoint {
                    host: "10.0.0.2".into(),
                    port: 3389,
                    credential_ref: "secret/s/rdp".into(),
                },
                storage_handle: "vol-fresh".into(),
                network_handle: "seg-fresh".into(),
            },
            0.0125,
        );
        assert_eq!(vm.state, VmState::Running);
        assert_eq!(vm.probe_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probe_resets_failure_streak() {
        let mut vm = handle();
        let sick = HealthReport {
            alive: true,
            ready: false,
        };
        let well = HealthReport {
            alive: true,
            ready: true,
        };

        assert_eq!(vm.record_probe(&sick), 1);
        assert_eq!(vm.record_probe(&sick), 2);
        assert_eq!(vm.record_probe(&well), 0);
        assert_eq!(vm.record_probe(&sick), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probe_recovers_unhealthy_state() {
        let mut vm = handle();
        vm.state = VmState::Unhealthy;
        vm.probe_failures = 3;
        vm.record_probe(&HealthReport {
            alive: true,
            ready: true,
        });
        assert_eq!(vm.state, VmState::Running);
        assert_eq!(vm.probe_failures, 0);
    }
}

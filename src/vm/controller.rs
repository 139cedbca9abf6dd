//! VM lifecycle controller - provisions, probes and destroys session VMs
//!
//! The controller is responsible for:
//! - Walking the provisioning plan's capacity ladder, one bounded attempt
//!   per candidate, falling through on capacity droughts
//! - Periodic health probing with a consecutive-failure threshold
//! - Bounded instance destruction (the backend must confirm the instance
//!   gone within the destroy timeout)
//!
//! It never touches session state; the session manager owns that.

use std::sync::Arc;

use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::backend::{BackendError, CloudBackend, HealthReport, ProvisionRequest};
use crate::config::Config;
use crate::cost::{CapacityType, ProvisioningPlan, ResourceSpec};
use crate::error::{OrchestratorError, Result};
use crate::metrics::{CAPACITY_FALLBACKS, LIVE_VMS, PROVISION_DURATION};
use crate::vm::VmHandle;

pub struct VmLifecycleController {
    backend: Arc<dyn CloudBackend>,
    config: Config,
}

impl VmLifecycleController {
    pub fn new(backend: Arc<dyn CloudBackend>, config: Config) -> Self {
        Self { backend, config }
    }

    /// Walk the plan's capacity ladder until one candidate provisions.
    ///
    /// Each attempt is bounded by `provision_attempt_timeout`. Capacity
    /// droughts, transient errors and attempt timeouts all fall through to
    /// the next candidate; `ProvisioningFailed` carries the attempt count
    /// and last error once the ladder is exhausted.
    pub async fn provision(
        &self,
        session_id: &str,
        user_id: &str,
        spec: ResourceSpec,
        plan: &ProvisioningPlan,
    ) -> Result<VmHandle> {
        let started = Instant::now();
        let mut attempts = 0usize;
        let mut last_error = String::from("empty provisioning plan");

        for candidate in &plan.candidates {
            attempts += 1;
            let req = ProvisionRequest {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                spec,
                candidate: candidate.clone(),
            };

            match timeout(
                self.config.provision_attempt_timeout,
                self.backend.provision(&req),
            )
            .await
            {
                Ok(Ok(instance)) => {
                    let vm = VmHandle::from_provisioned(instance, candidate.hourly_rate);
                    PROVISION_DURATION.observe(started.elapsed().as_secs_f64());
                    LIVE_VMS.inc();
                    info!(
                        session_id,
                        instance_id = %vm.instance_id,
                        capacity = %vm.capacity,
                        class = %vm.instance_class,
                        attempts,
                        "vm provisioned"
                    );
                    return Ok(vm);
                }
                Ok(Err(BackendError::CapacityUnavailable { class, capacity })) => {
                    CAPACITY_FALLBACKS.inc();
                    warn!(
                        session_id,
                        %class, %capacity, "capacity unavailable, trying next candidate"
                    );
                    last_error = format!("capacity unavailable: {class} ({capacity})");
                }
                Ok(Err(e)) => {
                    warn!(session_id, error = %e, "provision attempt failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        session_id,
                        timeout = ?self.config.provision_attempt_timeout,
                        "provision attempt timed out"
                    );
                    last_error = format!(
                        "attempt timed out after {:?}",
                        self.config.provision_attempt_timeout
                    );
                }
            }
        }

        Err(OrchestratorError::ProvisioningFailed {
            attempts,
            last_error,
        })
    }

    /// Provision an on-demand replacement for an interrupted spot VM.
    /// The plan is restricted to on-demand candidates; the caller bounds
    /// the whole call with the interruption grace window.
    pub async fn provision_replacement(
        &self,
        session_id: &str,
        user_id: &str,
        spec: ResourceSpec,
        plan: &ProvisioningPlan,
    ) -> Result<VmHandle> {
        let on_demand_only = ProvisioningPlan {
            candidates: plan
                .candidates
                .iter()
                .filter(|c| c.capacity == CapacityType::OnDemand)
                .cloned()
                .collect(),
        };
        if on_demand_only.candidates.is_empty() {
            return Err(OrchestratorError::ProvisioningFailed {
                attempts: 0,
                last_error: "no on-demand candidate available for replacement".into(),
            });
        }
        self.provision(session_id, user_id, spec, &on_demand_only)
            .await
    }

    /// Probe one VM and fold the result into its failure streak, bounded
    /// by the probe timeout. Probe errors and expired probes both count
    /// as failed probes. Crossing the configured threshold marks the VM
    /// Unhealthy and surfaces `HealthCheckFailed`.
    pub async fn health_check(&self, vm: &mut VmHandle) -> Result<HealthReport> {
        let dead = HealthReport {
            alive: false,
            ready: false,
        };
        let report = match timeout(self.config.probe_timeout, self.backend.probe(&vm.instance_id))
            .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                warn!(instance_id = %vm.instance_id, error = %e, "health probe errored");
                dead
            }
            Err(_) => {
                warn!(
                    instance_id = %vm.instance_id,
                    timeout = ?self.config.probe_timeout,
                    "health probe did not answer in time"
                );
                dead
            }
        };

        let consecutive = vm.record_probe(&report);
        if consecutive >= self.config.health_failure_threshold {
            vm.state = super::VmState::Unhealthy;
            return Err(OrchestratorError::HealthCheckFailed {
                instance_id: vm.instance_id.clone(),
                consecutive,
            });
        }
        Ok(report)
    }

    /// Destroy an instance and wait for backend confirmation, bounded by
    /// the destroy timeout. An already-gone instance counts as success.
    pub async fn destroy(&self, instance_id: &str, forced: bool) -> Result<()> {
        match timeout(
            self.config.destroy_timeout,
            self.backend.destroy(instance_id, forced),
        )
        .await
        {
            Ok(Ok(())) | Ok(Err(BackendError::NotFound(_))) => {
                LIVE_VMS.dec();
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(OrchestratorError::DestroyTimeout {
                instance_id: instance_id.to_string(),
                timeout: self.config.destroy_timeout,
            }),
        }
    }
}

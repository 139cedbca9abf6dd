//! Simulated cloud backend
//!
//! A deterministic in-memory `CloudBackend` with a scriptable fault plan:
//! spot capacity droughts, teardown failures that only yield to forced
//! parameters, isolation violations, interruption warnings and per-call
//! latency. Drives the demo binary and every lifecycle scenario test.
//!
//! Latency is modelled with `tokio::time::sleep`, so tests running under
//! `tokio::time::pause()` can fast-forward through hours of simulated
//! wall-clock in microseconds.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

use super::{
    BackendError, CloudBackend, ConnectionEndpoint, Destroyer, HealthProbe, HealthReport,
    InterruptionWarning, IsolationInspector, IsolationLayer, LayerFinding, ProvisionRequest,
    ProvisionedInstance, Provisioner, ResourceInventory, ResourceKind, ResourceRef,
};
use crate::cost::CapacityType;

/// Simulated latency knobs. Defaults are short but non-zero so that
/// timeout handling is actually exercised.
#[derive(Debug, Clone)]
pub struct SimLatency {
    pub spot_provision: Duration,
    pub on_demand_provision: Duration,
    pub teardown_op: Duration,
    pub probe: Duration,
    pub inspect: Duration,
}

impl Default for SimLatency {
    fn default() -> Self {
        Self {
            spot_provision: Duration::from_millis(200),
            on_demand_provision: Duration::from_millis(200),
            teardown_op: Duration::from_millis(50),
            probe: Duration::from_millis(10),
            inspect: Duration::from_millis(10),
        }
    }
}

#[derive(Debug)]
struct SimInstance {
    session_id: String,
    capacity: CapacityType,
    class: String,
    storage_handle: String,
    network_handle: String,
    healthy: bool,
    suspended: bool,
}

#[derive(Default)]
struct SimState {
    instances: HashMap<String, SimInstance>,
    /// volume id -> owning session (None = seeded orphan)
    volumes: HashMap<String, Option<String>>,
    /// segment id -> owning session (None = seeded orphan)
    segments: HashMap<String, Option<String>>,
    /// op name -> remaining scripted failures
    fault_counters: HashMap<&'static str, u32>,
    /// ops that only succeed when called with forced parameters
    force_required: HashMap<&'static str, bool>,
    /// persistent isolation violations per layer
    violations: HashMap<IsolationLayer, Vec<String>>,
    /// remaining transient (Unknown-producing) inspection errors per layer
    unknown_counters: HashMap<IsolationLayer, u32>,
    next_id: u64,
}

impl SimState {
    fn take_fault(&mut self, op: &'static str) -> bool {
        match self.fault_counters.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-memory backend with a scriptable fault plan.
pub struct SimBackend {
    state: Mutex<SimState>,
    latency: SimLatency,
    interruptions: broadcast::Sender<InterruptionWarning>,
    suspend_capable: bool,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    pub fn new() -> Self {
        Self::with_latency(SimLatency::default())
    }

    pub fn with_latency(latency: SimLatency) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(SimState::default()),
            latency,
            interruptions: tx,
            suspend_capable: false,
        }
    }

    /// Enable the suspend/resume capability.
    pub fn suspend_capable(mut self) -> Self {
        self.suspend_capable = true;
        self
    }

    /// Script the next `n` calls of `op` to fail. Op names: `provision_spot`,
    /// `provision_on_demand`, `graceful_shutdown`, `sanitize`, `destroy`,
    /// `reclaim_storage`, `reclaim_network`.
    pub fn fail_next(&self, op: &'static str, n: u32) {
        self.state.lock().unwrap().fault_counters.insert(op, n);
    }

    /// Make `op` succeed only when invoked with forced parameters; models
    /// resources that need the alternate API path.
    pub fn require_force(&self, op: &'static str) {
        self.state.lock().unwrap().force_required.insert(op, true);
    }

    /// Inject a persistent isolation violation for a layer.
    pub fn inject_violation(&self, layer: IsolationLayer, message: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .violations
            .entry(layer)
            .or_default()
            .push(message.into());
    }

    /// Clear injected violations (e.g. after a re-provision).
    pub fn clear_violations(&self) {
        self.state.lock().unwrap().violations.clear();
    }

    /// Make the next `n` inspections of a layer fail transiently, which the
    /// validator reports as `Unknown`.
    pub fn inject_unknown(&self, layer: IsolationLayer, n: u32) {
        self.state.lock().unwrap().unknown_counters.insert(layer, n);
    }

    /// Emit a spot interruption warning for an instance.
    pub fn inject_interruption(&self, instance_id: &str) {
        let _ = self.interruptions.send(InterruptionWarning {
            instance_id: instance_id.to_string(),
        });
    }

    /// Flip an instance's probe result.
    pub fn set_instance_health(&self, instance_id: &str, healthy: bool) {
        if let Some(inst) = self.state.lock().unwrap().instances.get_mut(instance_id) {
            inst.healthy = healthy;
        }
    }

    /// Seed a resource with no owning session, for orphan-sweep tests.
    pub fn seed_orphan(&self, kind: ResourceKind, id: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        match kind {
            ResourceKind::Volume => {
                state.volumes.insert(id.into(), None);
            }
            ResourceKind::NetworkSegment => {
                state.segments.insert(id.into(), None);
            }
            ResourceKind::Instance => {
                state.instances.insert(
                    id.into(),
                    SimInstance {
                        session_id: String::new(),
                        capacity: CapacityType::OnDemand,
                        class: "t3.medium".into(),
                        storage_handle: String::new(),
                        network_handle: String::new(),
                        healthy: true,
                        suspended: false,
                    },
                );
            }
        }
    }

    /// Number of live instances (test helper).
    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    fn teardown(&self, op: &'static str, forced: bool) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.take_fault(op) {
            return Err(BackendError::Api(format!("simulated {op} failure")));
        }
        if state.force_required.get(op).copied().unwrap_or(false) && !forced {
            return Err(BackendError::Api(format!(
                "simulated {op} refusal: forced parameters required"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for SimBackend {
    async fn provision(
        &self,
        req: &ProvisionRequest,
    ) -> Result<ProvisionedInstance, BackendError> {
        let (op, latency) = match req.candidate.capacity {
            CapacityType::Spot => ("provision_spot", self.latency.spot_provision),
            CapacityType::OnDemand => ("provision_on_demand", self.latency.on_demand_provision),
        };
        {
            let mut state = self.state.lock().unwrap();
            if state.take_fault(op) {
                return Err(BackendError::CapacityUnavailable {
                    class: req.candidate.instance_class.clone(),
                    capacity: req.candidate.capacity,
                });
            }
        }

        sleep(latency).await;

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let n = state.next_id;
        let instance_id = format!("i-{n:08x}");
        let storage_handle = format!("vol-{n:08x}");
        let network_handle = format!("seg-{n:08x}");

        state.instances.insert(
            instance_id.clone(),
            SimInstance {
                session_id: req.session_id.clone(),
                capacity: req.candidate.capacity,
                class: req.candidate.instance_class.clone(),
                storage_handle: storage_handle.clone(),
                network_handle: network_handle.clone(),
                healthy: true,
                suspended: false,
            },
        );
        state
            .volumes
            .insert(storage_handle.clone(), Some(req.session_id.clone()));
        state
            .segments
            .insert(network_handle.clone(), Some(req.session_id.clone()));

        Ok(ProvisionedInstance {
            instance_id: instance_id.clone(),
            capacity: req.candidate.capacity,
            instance_class: req.candidate.instance_class.clone(),
            spot_price: req.candidate.max_bid,
            endpoint: ConnectionEndpoint {
                host: format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff),
                port: 3389,
                credential_ref: format!("secret/{}/rdp", req.session_id),
            },
            storage_handle,
            network_handle,
        })
    }

    fn subscribe_interruptions(&self) -> broadcast::Receiver<InterruptionWarning> {
        self.interruptions.subscribe()
    }
}

#[async_trait]
impl HealthProbe for SimBackend {
    async fn probe(&self, instance_id: &str) -> Result<HealthReport, BackendError> {
        sleep(self.latency.probe).await;
        let state = self.state.lock().unwrap();
        match state.instances.get(instance_id) {
            Some(inst) => Ok(HealthReport {
                alive: inst.healthy,
                ready: inst.healthy && !inst.suspended,
            }),
            None => Err(BackendError::NotFound(instance_id.to_string())),
        }
    }
}

#[async_trait]
impl Destroyer for SimBackend {
    async fn graceful_shutdown(&self, instance_id: &str) -> Result<(), BackendError> {
        sleep(self.latency.teardown_op).await;
        self.teardown("graceful_shutdown", false)?;
        let state = self.state.lock().unwrap();
        if state.instances.contains_key(instance_id) {
            Ok(())
        } else {
            Err(BackendError::NotFound(instance_id.to_string()))
        }
    }

    async fn sanitize_storage(
        &self,
        storage_handle: &str,
        forced: bool,
    ) -> Result<(), BackendError> {
        sleep(self.latency.teardown_op).await;
        self.teardown("sanitize", forced)?;
        let state = self.state.lock().unwrap();
        if state.volumes.contains_key(storage_handle) {
            Ok(())
        } else {
            Err(BackendError::NotFound(storage_handle.to_string()))
        }
    }

    async fn destroy(&self, instance_id: &str, forced: bool) -> Result<(), BackendError> {
        sleep(self.latency.teardown_op).await;
        self.teardown("destroy", forced)?;
        let mut state = self.state.lock().unwrap();
        match state.instances.remove(instance_id) {
            Some(_) => Ok(()),
            // Already gone: termination is confirmed either way.
            None => Ok(()),
        }
    }

    async fn reclaim_storage(
        &self,
        storage_handle: &str,
        forced: bool,
    ) -> Result<(), BackendError> {
        sleep(self.latency.teardown_op).await;
        self.teardown("reclaim_storage", forced)?;
        self.state.lock().unwrap().volumes.remove(storage_handle);
        Ok(())
    }

    async fn reclaim_network(
        &self,
        network_handle: &str,
        forced: bool,
    ) -> Result<(), BackendError> {
        sleep(self.latency.teardown_op).await;
        self.teardown("reclaim_network", forced)?;
        self.state.lock().unwrap().segments.remove(network_handle);
        Ok(())
    }
}

#[async_trait]
impl IsolationInspector for SimBackend {
    async fn inspect(
        &self,
        layer: IsolationLayer,
        _instance_id: &str,
    ) -> Result<LayerFinding, BackendError> {
        sleep(self.latency.inspect).await;
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.unknown_counters.get_mut(&layer) {
            if *n > 0 {
                *n -= 1;
                return Err(BackendError::Timeout(format!(
                    "simulated transient {layer} inspection failure"
                )));
            }
        }
        match state.violations.get(&layer) {
            Some(v) if !v.is_empty() => Ok(LayerFinding {
                passed: false,
                violations: v.clone(),
            }),
            _ => Ok(LayerFinding::pass()),
        }
    }
}

#[async_trait]
impl ResourceInventory for SimBackend {
    async fn list_resources(&self) -> Result<Vec<ResourceRef>, BackendError> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (id, inst) in &state.instances {
            out.push(ResourceRef {
                kind: ResourceKind::Instance,
                id: id.clone(),
                session_id: (!inst.session_id.is_empty()).then(|| inst.session_id.clone()),
            });
        }
        for (id, session) in &state.volumes {
            out.push(ResourceRef {
                kind: ResourceKind::Volume,
                id: id.clone(),
                session_id: session.clone(),
            });
        }
        for (id, session) in &state.segments {
            out.push(ResourceRef {
                kind: ResourceKind::NetworkSegment,
                id: id.clone(),
                session_id: session.clone(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl CloudBackend for SimBackend {
    fn supports_suspend(&self) -> bool {
        self.suspend_capable
    }

    async fn suspend_instance(&self, instance_id: &str) -> Result<(), BackendError> {
        if !self.suspend_capable {
            return Err(BackendError::NotSupported("suspend"));
        }
        let mut state = self.state.lock().unwrap();
        match state.instances.get_mut(instance_id) {
            Some(inst) => {
                inst.suspended = true;
                Ok(())
            }
            None => Err(BackendError::NotFound(instance_id.to_string())),
        }
    }

    async fn resume_instance(&self, instance_id: &str) -> Result<(), BackendError> {
        if !self.suspend_capable {
            return Err(BackendError::NotSupported("resume"));
        }
        let mut state = self.state.lock().unwrap();
        match state.instances.get_mut(instance_id) {
            Some(inst) => {
                inst.suspended = false;
                Ok(())
            }
            None => Err(BackendError::NotFound(instance_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{CapacityCandidate, ResourceSpec};

    fn request(capacity: CapacityType) -> ProvisionRequest {
        ProvisionRequest {
            session_id: "session-test".into(),
            user_id: "user-test".into(),
            spec: ResourceSpec::default(),
            candidate: CapacityCandidate {
                capacity,
                instance_class: "t3.medium".into(),
                hourly_rate: 0.0125,
                max_bid: (capacity == CapacityType::Spot).then_some(0.0125),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_spot_failures_then_success() {
        let backend = SimBackend::new();
        backend.fail_next("provision_spot", 2);

        for _ in 0..2 {
            let err = backend.provision(&request(CapacityType::Spot)).await;
            assert!(matches!(
                err,
                Err(BackendError::CapacityUnavailable { .. })
            ));
        }
        assert!(backend.provision(&request(CapacityType::Spot)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_removes_instance_from_inventory() {
        let backend = SimBackend::new();
        let vm = backend
            .provision(&request(CapacityType::OnDemand))
            .await
            .unwrap();
        assert_eq!(backend.instance_count(), 1);
        backend.destroy(&vm.instance_id, false).await.unwrap();
        assert_eq!(backend.instance_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn force_required_op_rejects_unforced_calls() {
        let backend = SimBackend::new();
        let vm = backend
            .provision(&request(CapacityType::OnDemand))
            .await
            .unwrap();
        backend.require_force("reclaim_storage");

        assert!(backend
            .reclaim_storage(&vm.storage_handle, false)
            .await
            .is_err());
        assert!(backend
            .reclaim_storage(&vm.storage_handle, true)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_counter_produces_transient_then_pass() {
        let backend = SimBackend::new();
        backend.inject_unknown(IsolationLayer::Network, 1);

        let first = backend.inspect(IsolationLayer::Network, "i-1").await;
        assert!(matches!(first, Err(e) if e.is_transient()));
        let second = backend.inspect(IsolationLayer::Network, "i-1").await;
        assert!(second.unwrap().passed);
    }
}

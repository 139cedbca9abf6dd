//! Cost optimizer - capacity planning and spend estimation
//!
//! Produces the ordered capacity ladder the VM lifecycle controller walks
//! (preferred spot -> alternate spot -> on-demand), estimates accrued spend
//! for budget enforcement, and emits advisory right-sizing recommendations.
//! Spot bids are capped at roughly 30% of the on-demand rate; a spot
//! candidate is only planned ahead of on-demand when its predicted
//! interruption probability is below the configured threshold.

use serde::Serialize;
use tokio::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Spot (interruptible, cheap) vs on-demand (stable, costlier) capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    Spot,
    OnDemand,
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Resource requirements for one session VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSpec {
    pub vcpus: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            vcpus: 2,
            memory_gb: 4,
            disk_gb: 50,
        }
    }
}

/// Planning preferences, derived from config plus per-request overrides.
#[derive(Debug, Clone, Copy)]
pub struct SpotPreferences {
    pub allow_spot: bool,
    /// Spot is planned first only below this predicted probability.
    pub interruption_threshold: f64,
    /// Candidates pricier than this are dropped from the plan entirely.
    pub max_hourly_cost: Option<f64>,
}

/// One rung of the provisioning ladder.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityCandidate {
    pub capacity: CapacityType,
    pub instance_class: String,
    /// Effective hourly rate: the spot ceiling bid or the on-demand rate.
    pub hourly_rate: f64,
    /// Maximum bid, present only for spot candidates.
    pub max_bid: Option<f64>,
}

/// Ordered list of capacity candidates; the controller attempts them in
/// order and fails with `ProvisioningFailed` once exhausted.
#[derive(Debug, Clone)]
pub struct ProvisioningPlan {
    pub candidates: Vec<CapacityCandidate>,
}

/// Advisory recommendation produced by `right_size`; never applied to a
/// running session.
#[derive(Debug, Clone, Serialize)]
pub struct RightSizingAdvice {
    pub current_class: String,
    pub recommended_class: String,
    pub hourly_savings: f64,
}

/// Maximum spot bid as a fraction of the on-demand rate.
const MAX_SPOT_PRICE_PERCENT: f64 = 0.30;

/// Static catalogue entry for one instance class.
struct InstanceClass {
    name: &'static str,
    vcpus: u32,
    memory_gb: u32,
    on_demand: f64,
    /// Historical interruption rate estimate for the class.
    interruption_probability: f64,
}

/// Burstable general-purpose classes, cheapest first within each size.
/// The a-variants are the alternate (AMD) pool used as the second spot rung.
const CATALOGUE: &[InstanceClass] = &[
    InstanceClass { name: "t3a.medium", vcpus: 2, memory_gb: 4, on_demand: 0.0376, interruption_probability: 0.07 },
    InstanceClass { name: "t3.medium", vcpus: 2, memory_gb: 4, on_demand: 0.0416, interruption_probability: 0.05 },
    InstanceClass { name: "t3a.large", vcpus: 2, memory_gb: 8, on_demand: 0.0752, interruption_probability: 0.09 },
    InstanceClass { name: "t3.large", vcpus: 2, memory_gb: 8, on_demand: 0.0832, interruption_probability: 0.08 },
    InstanceClass { name: "t3a.xlarge", vcpus: 4, memory_gb: 16, on_demand: 0.1504, interruption_probability: 0.11 },
    InstanceClass { name: "t3.xlarge", vcpus: 4, memory_gb: 16, on_demand: 0.1664, interruption_probability: 0.10 },
    InstanceClass { name: "t3a.2xlarge", vcpus: 8, memory_gb: 32, on_demand: 0.3008, interruption_probability: 0.14 },
    InstanceClass { name: "t3.2xlarge", vcpus: 8, memory_gb: 32, on_demand: 0.3328, interruption_probability: 0.12 },
];

/// Chooses capacity type and instance size; predicts spot viability.
#[derive(Debug, Default)]
pub struct CostOptimizer;

impl CostOptimizer {
    pub fn new() -> Self {
        Self
    }

    /// Build the ordered capacity ladder for a resource spec.
    ///
    /// Spot-first when allowed and the preferred class's predicted
    /// interruption probability is below the threshold; otherwise
    /// on-demand leads and spot (if allowed at all) trails as a last
    /// resort. Candidates above `max_hourly_cost` are dropped.
    pub fn plan(&self, spec: ResourceSpec, prefs: &SpotPreferences) -> Result<ProvisioningPlan> {
        let mut fitting: Vec<&InstanceClass> = CATALOGUE
            .iter()
            .filter(|c| c.vcpus >= spec.vcpus && c.memory_gb >= spec.memory_gb)
            .collect();
        // Smallest adequate class first; the catalogue is price-ordered
        // within a size so this is also cheapest-first.
        fitting.sort_by(|a, b| {
            a.on_demand
                .partial_cmp(&b.on_demand)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let preferred = fitting.first().copied().ok_or_else(|| {
            OrchestratorError::ProvisioningFailed {
                attempts: 0,
                last_error: format!(
                    "no instance class satisfies {} vCPU / {} GiB",
                    spec.vcpus, spec.memory_gb
                ),
            }
        })?;
        let alternate = fitting.get(1).copied();

        let spot_viable = prefs.allow_spot
            && preferred.interruption_probability < prefs.interruption_threshold;

        let mut candidates = Vec::new();
        if spot_viable {
            candidates.push(spot_candidate(preferred));
            if let Some(alt) = alternate {
                candidates.push(spot_candidate(alt));
            }
            candidates.push(on_demand_candidate(preferred));
        } else {
            candidates.push(on_demand_candidate(preferred));
            if let Some(alt) = alternate {
                candidates.push(on_demand_candidate(alt));
            }
            if prefs.allow_spot {
                candidates.push(spot_candidate(preferred));
            }
        }

        if let Some(cap) = prefs.max_hourly_cost {
            candidates.retain(|c| c.hourly_rate <= cap);
        }

        if candidates.is_empty() {
            return Err(OrchestratorError::ProvisioningFailed {
                attempts: 0,
                last_error: "all capacity candidates exceed the hourly cost cap".into(),
            });
        }

        Ok(ProvisioningPlan { candidates })
    }

    /// Estimated spend for `elapsed` at a candidate's hourly rate.
    /// Recomputed on demand; monotone in `elapsed`.
    pub fn estimate_cost(&self, elapsed: Duration, hourly_rate: f64) -> f64 {
        elapsed.as_secs_f64() / 3600.0 * hourly_rate
    }

    /// Advisory right-sizing: recommend a smaller class when sustained CPU
    /// utilization is low and a cheaper class still fits the workload.
    /// Never resizes anything itself.
    pub fn right_size(
        &self,
        current_class: &str,
        avg_cpu_percent: f64,
    ) -> Option<RightSizingAdvice> {
        if avg_cpu_percent >= 30.0 {
            return None;
        }
        let current = CATALOGUE.iter().find(|c| c.name == current_class)?;
        let smaller = CATALOGUE
            .iter()
            .filter(|c| c.vcpus < current.vcpus || c.memory_gb < current.memory_gb)
            .filter(|c| c.on_demand < current.on_demand)
            .max_by(|a, b| {
                a.on_demand
                    .partial_cmp(&b.on_demand)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
        Some(RightSizingAdvice {
            current_class: current.name.to_string(),
            recommended_class: smaller.name.to_string(),
            hourly_savings: current.on_demand - smaller.on_demand,
        })
    }
}

fn spot_candidate(class: &InstanceClass) -> CapacityCandidate {
    let max_bid = class.on_demand * MAX_SPOT_PRICE_PERCENT;
    CapacityCandidate {
        capacity: CapacityType::Spot,
        instance_class: class.name.to_string(),
        hourly_rate: max_bid,
        max_bid: Some(max_bid),
    }
}

fn on_demand_candidate(class: &InstanceClass) -> CapacityCandidate {
    CapacityCandidate {
        capacity: CapacityType::OnDemand,
        instance_class: class.name.to_string(),
        hourly_rate: class.on_demand,
        max_bid: None,
    }
}

//! The ratio-adjustment algorithm, and the background loop that drives it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::JobTypeManager;

/// A snapshot of every job type's current ratio, `job_type_id -> ratio`.
///
/// Cloned cheaply and distributed via a [`tokio::sync::watch`] channel so readers (slot
/// acquisition, the memory manager) always see a consistent point-in-time table without
/// blocking the single writer.
pub type RatioTable = HashMap<String, f64>;

/// One flexible job type's demand sample for a ratio-adjustment tick.
#[derive(Debug, Clone, Copy)]
pub struct Demand {
    /// Slots currently issued (in flight) for this job type.
    pub active: u64,
    /// Callers currently blocked waiting for a slot of this job type.
    pub queued: u64,
}

impl Demand {
    fn total(&self) -> f64 {
        (self.active + self.queued) as f64
    }
}

/// Recomputes flexible ratios for one tick, given the current table, each flexible job
/// type's demand, and the combined ratio of non-flexible job types `fixed_budget`.
///
/// The algorithm:
/// - `demandShare_j = demand_j / Σ demand` over flexible types.
/// - `target_j = (1 - fixed_budget) * demandShare_j`.
/// - `r_j <- (1 - α) * r_j + α * target_j` (exponential smoothing).
/// - re-normalize so `Σ flexible + fixed_budget == 1`.
///
/// If no flexible job type has any demand, ratios are left untouched — there is nothing
/// to redistribute towards.
pub fn recompute_flexible_ratios(
    current: &RatioTable,
    demand: &HashMap<String, Demand>,
    fixed_budget: f64,
    smoothing_factor: f64,
) -> RatioTable {
    let mut updated = current.clone();

    let total_demand: f64 = demand.values().map(Demand::total).sum();
    if total_demand <= 0.0 || demand.is_empty() {
        return updated;
    }

    let flexible_budget = (1.0 - fixed_budget).max(0.0);

    for (job_type, d) in demand {
        let demand_share = d.total() / total_demand;
        let target = flexible_budget * demand_share;
        let prior = *current.get(job_type).unwrap_or(&0.0);
        let smoothed = (1.0 - smoothing_factor) * prior + smoothing_factor * target;
        updated.insert(job_type.clone(), smoothed);
    }

    // Re-normalize the flexible subset so it sums to exactly `flexible_budget`.
    let flexible_sum: f64 = demand.keys().map(|k| updated[k]).sum();
    if flexible_sum > 0.0 {
        for job_type in demand.keys() {
            let entry = updated.get_mut(job_type).expect("just inserted above");
            *entry = *entry / flexible_sum * flexible_budget;
        }
    }

    updated
}

/// Spawns the background tick loop that samples demand and republishes ratios, until
/// `cancel` fires. Returns immediately if there are no flexible job types to adjust.
pub(super) fn spawn_adjustment_loop(manager: Arc<JobTypeManager>, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
    if !manager.has_flexible_job_types() {
        return None;
    }

    let tick = manager.tunables_tick();
    let alpha = manager.tunables_smoothing_factor();

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("ratio adjustment loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    manager.run_adjustment_tick(alpha).await;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_flexible_type_gains_share_over_time() {
        let mut ratios: RatioTable = HashMap::new();
        ratios.insert("fixed".into(), 0.4);
        ratios.insert("flex".into(), 0.6);

        let mut demand = HashMap::new();
        demand.insert(
            "flex".to_string(),
            Demand {
                active: 100,
                queued: 50,
            },
        );

        // fixed_budget 0.4 leaves 0.6 for flex — the whole flexible budget, since it's
        // the only flexible job type with any demand.
        let mut current = ratios.clone();
        for _ in 0..50 {
            current = recompute_flexible_ratios(&current, &demand, 0.4, 0.2);
        }

        assert!(
            (current["flex"] - 0.6).abs() < 1e-6,
            "flex should converge to the entire flexible budget: {}",
            current["flex"]
        );
        assert_eq!(ratios["fixed"], 0.4, "fixed ratio must stay untouched by this function");
    }

    #[test]
    fn no_demand_leaves_ratios_untouched() {
        let mut ratios: RatioTable = HashMap::new();
        ratios.insert("flex".into(), 0.6);
        let demand = HashMap::new();

        let updated = recompute_flexible_ratios(&ratios, &demand, 0.4, 0.2);
        assert_eq!(updated, ratios);
    }
}

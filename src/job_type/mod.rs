//! Per-job-type slot pool and the ratio-adjustment loop.
//!
//! This generalizes the weighted, static-partition scheduler a plain concurrency
//! limiter would use into one with ratios that move over time for job types flagged
//! `flexible`. Non-flexible ratios are immutable once configured.

mod ratios;

pub use ratios::{recompute_flexible_ratios, Demand, RatioTable};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{JobTypeConfig, Tunables};

/// A held job-type slot. Releasing happens automatically on drop, or explicitly via
/// [`JobTypeManager::release`], which simply drops it early.
#[derive(Debug)]
pub struct SlotToken {
    job_type: String,
    issued: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl SlotToken {
    /// The job type this slot was issued for.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        self.issued.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

struct JobTypeState {
    config: JobTypeConfig,
    issued: Arc<AtomicU64>,
    queued: Arc<AtomicU64>,
}

/// A snapshot of one job type's pool for `getJobTypeStats`.
#[derive(Debug, Clone)]
pub struct JobTypeSnapshot {
    /// Job type id.
    pub job_type: String,
    /// Current ratio (fixed, or the latest smoothed value if flexible).
    pub ratio: f64,
    /// Slot pool size at the current capacity and ratio.
    pub pool_size: u64,
    /// Slots currently issued.
    pub issued: u64,
    /// Callers currently waiting for a slot.
    pub queued: u64,
}

/// The job-type slot pool manager.
pub struct JobTypeManager {
    states: HashMap<String, JobTypeState>,
    ratios_tx: watch::Sender<RatioTable>,
    ratios_rx: watch::Receiver<RatioTable>,
    capacity: AtomicU64,
    notify: Arc<Notify>,
    fixed_ratio_budget: f64,
    tick: Duration,
    smoothing_factor: f64,
    wait_poll_interval: Duration,
}

impl JobTypeManager {
    /// Builds a manager for the given job types, with an initial local capacity `C`
    /// (typically the sum of per-instance model pool sizes).
    pub fn new(configs: &HashMap<String, JobTypeConfig>, tunables: &Tunables, initial_capacity: u64) -> Self {
        let mut states = HashMap::with_capacity(configs.len());
        let mut ratios = RatioTable::new();
        let mut fixed_ratio_budget = 0.0;

        for config in configs.values() {
            ratios.insert(config.id.clone(), config.initial_ratio);
            if !config.flexible {
                fixed_ratio_budget += config.initial_ratio;
            }
            states.insert(
                config.id.clone(),
                JobTypeState {
                    config: config.clone(),
                    issued: Arc::new(AtomicU64::new(0)),
                    queued: Arc::new(AtomicU64::new(0)),
                },
            );
        }

        let (ratios_tx, ratios_rx) = watch::channel(ratios);

        Self {
            states,
            ratios_tx,
            ratios_rx,
            capacity: AtomicU64::new(initial_capacity),
            notify: Arc::new(Notify::new()),
            fixed_ratio_budget,
            tick: tunables.ratio_adjustment_tick,
            smoothing_factor: tunables.smoothing_factor,
            wait_poll_interval: tunables.wait_poll_interval,
        }
    }

    /// Starts the ratio-adjustment background loop (no-op if no job type is flexible).
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        ratios::spawn_adjustment_loop(Arc::clone(self), cancel)
    }

    pub(super) fn has_flexible_job_types(&self) -> bool {
        self.states.values().any(|s| s.config.flexible)
    }

    pub(super) fn tunables_tick(&self) -> Duration {
        self.tick
    }

    pub(super) fn tunables_smoothing_factor(&self) -> f64 {
        self.smoothing_factor
    }

    /// The poll interval used by every cooperative wait loop (typically `<= 100ms`) —
    /// shared with the delegation executor's capacity-change wait.
    pub(super) fn tunables_wait_poll_interval(&self) -> Duration {
        self.wait_poll_interval
    }

    /// Updates the local capacity `C` used to derive pool sizes, e.g. after a new
    /// [`crate::coordination::Allocation`] arrives.
    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn current_ratio(&self, job_type: &str) -> f64 {
        self.ratios_rx.borrow().get(job_type).copied().unwrap_or(0.0)
    }

    /// The job type's current share of local capacity — fixed, or the latest smoothed
    /// value if flexible. Used by [`crate::memory::MemoryManager`] to size partitions.
    pub fn ratio(&self, job_type: &str) -> f64 {
        self.current_ratio(job_type)
    }

    fn pool_size(&self, job_type: &str) -> u64 {
        let Some(state) = self.states.get(job_type) else {
            return 0;
        };
        let capacity = self.capacity.load(Ordering::Acquire) as f64;
        let ratio = self.current_ratio(job_type);
        let raw = (capacity * ratio).floor() as u64;
        let clamped_low = state.config.min_capacity.map_or(raw, |min| raw.max(min));
        state
            .config
            .max_capacity
            .map_or(clamped_low, |max| clamped_low.min(max))
    }

    /// Whether `job_type` is configured at all.
    pub fn is_known(&self, job_type: &str) -> bool {
        self.states.contains_key(job_type)
    }

    /// A cheap, non-reserving check: is there a free slot for `job_type` right now?
    pub fn has_capacity(&self, job_type: &str) -> bool {
        match self.states.get(job_type) {
            Some(state) => state.issued.load(Ordering::Acquire) < self.pool_size(job_type),
            None => false,
        }
    }

    /// Waits for and acquires a slot for `job_type`.
    ///
    /// Cooperative wait: rechecks on every capacity-change signal (a release or a ratio
    /// update) and at least every `wait_poll_interval`. Returns `None` if `cancel` fires
    /// first. Returns `None` immediately if `job_type` isn't configured — callers should
    /// check [`Self::is_known`] first to distinguish "unknown" from "cancelled".
    pub async fn acquire_slot(&self, job_type: &str, cancel: &CancellationToken) -> Option<SlotToken> {
        let state = self.states.get(job_type)?;
        let issued = Arc::clone(&state.issued);
        let queued = Arc::clone(&state.queued);

        queued.fetch_add(1, Ordering::AcqRel);
        let result = loop {
            if cancel.is_cancelled() {
                break None;
            }

            let pool = self.pool_size(job_type);
            let current = issued.load(Ordering::Acquire);
            if current < pool
                && issued
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break Some(SlotToken {
                    job_type: job_type.to_string(),
                    issued: Arc::clone(&issued),
                    notify: Arc::clone(&self.notify),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => break None,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.wait_poll_interval) => {}
            }
        };
        queued.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Releases a slot back to the pool. Equivalent to dropping the token.
    pub fn release(&self, token: SlotToken) {
        drop(token);
    }

    /// Runs one ratio-adjustment tick: samples demand on every flexible job type and
    /// republishes smoothed ratios.
    pub(super) async fn run_adjustment_tick(&self, smoothing_factor: f64) {
        let mut demand = HashMap::new();
        for (id, state) in &self.states {
            if state.config.flexible {
                demand.insert(
                    id.clone(),
                    Demand {
                        active: state.issued.load(Ordering::Acquire),
                        queued: state.queued.load(Ordering::Acquire),
                    },
                );
            }
        }
        if demand.is_empty() {
            return;
        }

        let current = self.ratios_rx.borrow().clone();
        let updated = recompute_flexible_ratios(&current, &demand, self.fixed_ratio_budget, smoothing_factor);

        if updated != current {
            tracing::debug!(?updated, "ratio adjustment tick republished flexible ratios");
            let _ = self.ratios_tx.send(updated);
            self.notify.notify_waiters();
        }
    }

    /// A snapshot of every job type's pool for `getJobTypeStats`.
    pub fn snapshot(&self) -> Vec<JobTypeSnapshot> {
        self.states
            .keys()
            .map(|id| JobTypeSnapshot {
                job_type: id.clone(),
                ratio: self.current_ratio(id),
                pool_size: self.pool_size(id),
                issued: self.states[id].issued.load(Ordering::Acquire),
                queued: self.states[id].queued.load(Ordering::Acquire),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_type(id: &str, ratio: f64, flexible: bool) -> JobTypeConfig {
        JobTypeConfig {
            id: id.to_string(),
            estimated_tokens: 100,
            estimated_requests: 1,
            estimated_memory_kb: 0,
            initial_ratio: ratio,
            flexible,
            min_capacity: None,
            max_capacity: None,
        }
    }

    fn tunables() -> Tunables {
        Tunables {
            wait_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn acquire_respects_pool_size_from_ratio() {
        let mut configs = HashMap::new();
        configs.insert("chat".into(), job_type("chat", 1.0, false));
        let mgr = JobTypeManager::new(&configs, &tunables(), 2);

        let cancel = CancellationToken::new();
        let t1 = mgr.acquire_slot("chat", &cancel).await.unwrap();
        let t2 = mgr.acquire_slot("chat", &cancel).await.unwrap();
        assert!(!mgr.has_capacity("chat"));

        let mgr = Arc::new(mgr);
        let mgr2 = Arc::clone(&mgr);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { mgr2.acquire_slot("chat", &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.release(t1);

        let t3 = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("should not time out")
            .unwrap();
        assert!(t3.is_some(), "release should wake the waiter");
        mgr.release(t2);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiter() {
        let mut configs = HashMap::new();
        configs.insert("chat".into(), job_type("chat", 1.0, false));
        let mgr = JobTypeManager::new(&configs, &tunables(), 0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(mgr.acquire_slot("chat", &cancel).await.is_none());
    }

    #[tokio::test]
    async fn unknown_job_type_is_distinguishable() {
        let mgr = JobTypeManager::new(&HashMap::new(), &tunables(), 10);
        assert!(!mgr.is_known("ghost"));
        let cancel = CancellationToken::new();
        assert!(mgr.acquire_slot("ghost", &cancel).await.is_none());
    }

    #[tokio::test]
    async fn fixed_ratio_is_immune_to_adjustment() {
        let mut configs = HashMap::new();
        configs.insert("fixed".into(), job_type("fixed", 0.4, false));
        configs.insert("flex".into(), job_type("flex", 0.6, true));
        let mgr = Arc::new(JobTypeManager::new(&configs, &tunables(), 100));

        let cancel = CancellationToken::new();
        let mut tokens = Vec::new();
        for _ in 0..50 {
            if let Some(t) = mgr.acquire_slot("flex", &cancel).await {
                tokens.push(t);
            } else {
                break;
            }
        }

        for _ in 0..10 {
            mgr.run_adjustment_tick(0.2).await;
        }

        let snap = mgr.snapshot();
        let fixed = snap.iter().find(|s| s.job_type == "fixed").unwrap();
        let flex = snap.iter().find(|s| s.job_type == "flex").unwrap();
        assert_eq!(fixed.ratio, 0.4, "non-flexible ratio never moves");
        assert!(flex.ratio > 0.6 - 1e-9, "saturated flexible type should hold or grow its share");
    }
}

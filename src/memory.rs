//! Process-wide memory reservation, partitioned by job-type ratios.
//!
//! The memory manager is the only truly process-global resource — every other
//! piece of state is per-model or per-job. Reservations are strict: if the
//! ratio-partitioned budget for a job type is exhausted locally, the caller waits even
//! when distributed slots exist elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

/// A held memory reservation for one job. Must be released exactly once.
#[derive(Debug)]
pub struct MemoryReservation {
    job_type: String,
    kb: u64,
}

/// Partitions a fixed KB budget across job types by their current ratio.
pub struct MemoryManager {
    budget_kb: u64,
    used_by_job_type: Mutex<HashMap<String, u64>>,
    total_used_kb: AtomicU64,
}

impl MemoryManager {
    /// Creates a manager governing `budget_kb` total, process-wide.
    pub fn new(budget_kb: u64) -> Self {
        Self {
            budget_kb,
            used_by_job_type: Mutex::new(HashMap::new()),
            total_used_kb: AtomicU64::new(0),
        }
    }

    /// The per-job-type cap, `floor(budget_kb * ratio)`.
    fn partition_cap(&self, ratio: f64) -> u64 {
        ((self.budget_kb as f64) * ratio).floor() as u64
    }

    /// Attempts to reserve `kb` for `job_type`, whose current share of the budget is
    /// `ratio` (looked up from [`crate::job_type::JobTypeManager`] at call time, since
    /// ratios move under the ratio-adjustment loop).
    ///
    /// Returns `None` if this job type's partition is already at or over its cap.
    pub async fn acquire(&self, job_type: &str, kb: u64, ratio: f64) -> Option<MemoryReservation> {
        let cap = self.partition_cap(ratio);
        let mut used = self.used_by_job_type.lock().await;
        let current = *used.get(job_type).unwrap_or(&0);
        if current + kb > cap {
            return None;
        }
        used.insert(job_type.to_string(), current + kb);
        drop(used);
        self.total_used_kb.fetch_add(kb, Ordering::SeqCst);
        Some(MemoryReservation {
            job_type: job_type.to_string(),
            kb,
        })
    }

    /// Releases a previously acquired reservation.
    pub async fn release(&self, reservation: MemoryReservation) {
        let mut used = self.used_by_job_type.lock().await;
        if let Some(current) = used.get_mut(&reservation.job_type) {
            *current = current.saturating_sub(reservation.kb);
        }
        drop(used);
        self.total_used_kb
            .fetch_sub(reservation.kb, Ordering::SeqCst);
    }

    /// Total KB currently held across every job type.
    pub fn total_used_kb(&self) -> u64 {
        self.total_used_kb.load(Ordering::Acquire)
    }

    /// The configured process-wide budget.
    pub fn budget_kb(&self) -> u64 {
        self.budget_kb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partition_caps_independently() {
        let mgr = MemoryManager::new(1000);

        let a = mgr.acquire("analysis", 400, 0.4).await.unwrap();
        assert!(
            mgr.acquire("analysis", 1, 0.4).await.is_none(),
            "analysis partition (400KB cap) is full"
        );

        let b = mgr.acquire("chat", 500, 0.6).await;
        assert!(b.is_some(), "chat has its own 600KB cap, unaffected by analysis");

        mgr.release(a).await;
        assert!(mgr.acquire("analysis", 400, 0.4).await.is_some());
        mgr.release(b.unwrap()).await;
    }

    #[tokio::test]
    async fn release_frees_exact_amount() {
        let mgr = MemoryManager::new(1000);
        let r = mgr.acquire("x", 300, 1.0).await.unwrap();
        assert_eq!(mgr.total_used_kb(), 300);
        mgr.release(r).await;
        assert_eq!(mgr.total_used_kb(), 0);
    }
}

//! Derives a single "available slots" scalar plus per-dimension residuals, and emits
//! change events — suppressing no-op emissions.
//!
//! The natural cyclic reference (the tracker reads limiters' snapshots; limiters would
//! otherwise need to notify the tracker directly) is broken with a one-way broadcast
//! bus: callers push [`Availability`] updates in here as they observe them (after a
//! reservation, release, commit, or ratio change), and the tracker is the only side that
//! decides whether anything actually changed.

use std::collections::HashMap;

use tokio::sync::{broadcast, Mutex};

use crate::model_limiter::ModelSnapshot;
use crate::model_limiter::Estimate;

/// Priority order used to label an emitted change with its highest-priority mover:
/// `adjustment > TPM > TPD > RPM > RPD > concurrency > memory > distributed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangedDimension {
    /// A job-type ratio adjustment changed the local slot pool.
    Adjustment,
    /// Tokens-per-minute residual changed.
    Tpm,
    /// Tokens-per-day residual changed.
    Tpd,
    /// Requests-per-minute residual changed.
    Rpm,
    /// Requests-per-day residual changed.
    Rpd,
    /// Concurrency residual changed.
    Concurrency,
    /// Memory residual changed.
    Memory,
    /// A distributed allocation push changed local quotas.
    Distributed,
}

/// The derived availability for one `(model, job_type)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Availability {
    /// `floor(min over configured dimensions of remaining / estimated_per_job)`, or
    /// `None` if no dimension is configured at all.
    pub slots: Option<u64>,
    /// Tokens-per-minute residual, `None` if not configured for this model.
    pub tpm: Option<u64>,
    /// Tokens-per-day residual, `None` if not configured.
    pub tpd: Option<u64>,
    /// Requests-per-minute residual, `None` if not configured.
    pub rpm: Option<u64>,
    /// Requests-per-day residual, `None` if not configured.
    pub rpd: Option<u64>,
    /// Concurrency residual (free permits), always present.
    pub concurrency: Option<u64>,
    /// Job-type memory partition residual, `None` if the job type declares no memory
    /// estimate.
    pub memory: Option<u64>,
}

impl Availability {
    /// Computes availability for `snapshot` against one job type's `estimate` and
    /// memory partition residual.
    pub fn compute(snapshot: &ModelSnapshot, estimate: Estimate, memory_remaining_kb: Option<u64>) -> Self {
        let div = |remaining: u64, per_job: u64| -> u64 {
            if per_job == 0 {
                remaining
            } else {
                remaining / per_job
            }
        };

        let tpm = snapshot.tpm.map(|s| div(s.remaining, estimate.tokens));
        let tpd = snapshot.tpd.map(|s| div(s.remaining, estimate.tokens));
        let rpm = snapshot.rpm.map(|s| div(s.remaining, estimate.requests));
        let rpd = snapshot.rpd.map(|s| div(s.remaining, estimate.requests));
        let concurrency = snapshot
            .max_concurrent
            .map(|max| max.saturating_sub(snapshot.in_flight));
        let memory = memory_remaining_kb;

        let slots = [tpm, tpd, rpm, rpd, concurrency, memory]
            .into_iter()
            .flatten()
            .min();

        Self {
            slots,
            tpm,
            tpd,
            rpm,
            rpd,
            concurrency,
            memory,
        }
    }

    /// Finds the highest-priority dimension that differs between `self` and `prior`.
    /// Returns `None` if nothing differs.
    fn highest_priority_change(&self, prior: &Availability) -> Option<ChangedDimension> {
        if self.tpm != prior.tpm {
            return Some(ChangedDimension::Tpm);
        }
        if self.tpd != prior.tpd {
            return Some(ChangedDimension::Tpd);
        }
        if self.rpm != prior.rpm {
            return Some(ChangedDimension::Rpm);
        }
        if self.rpd != prior.rpd {
            return Some(ChangedDimension::Rpd);
        }
        if self.concurrency != prior.concurrency {
            return Some(ChangedDimension::Concurrency);
        }
        if self.memory != prior.memory {
            return Some(ChangedDimension::Memory);
        }
        None
    }
}

/// An emitted availability change, labeled with the highest-priority dimension that
/// moved.
#[derive(Debug, Clone)]
pub struct AvailabilityEvent {
    /// The model this availability is computed for.
    pub model_id: String,
    /// The job type this availability is computed for.
    pub job_type: String,
    /// The new availability.
    pub availability: Availability,
    /// Which dimension's change triggered this emission.
    pub changed: ChangedDimension,
}

/// The availability tracker.
pub struct AvailabilityTracker {
    last: Mutex<HashMap<(String, String), Availability>>,
    events: broadcast::Sender<AvailabilityEvent>,
}

impl AvailabilityTracker {
    /// Builds a tracker with the given broadcast buffer size for change events.
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self {
            last: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to availability change events.
    pub fn subscribe(&self) -> broadcast::Receiver<AvailabilityEvent> {
        self.events.subscribe()
    }

    /// Reports a freshly computed availability for `(model_id, job_type)`. Emits a
    /// change event iff the scalar or any non-null residual differs from the last
    /// reported value — equal-value emissions are suppressed.
    pub async fn update(&self, model_id: &str, job_type: &str, availability: Availability) {
        let key = (model_id.to_string(), job_type.to_string());
        let mut last = self.last.lock().await;
        let prior = last.get(&key).copied();

        let changed = match prior {
            None => Some(ChangedDimension::Adjustment),
            Some(prior) if prior.slots != availability.slots => availability
                .highest_priority_change(&prior)
                .or(Some(ChangedDimension::Adjustment)),
            Some(prior) => availability.highest_priority_change(&prior),
        };

        if let Some(changed) = changed {
            last.insert(key, availability);
            drop(last);
            // No receivers is a normal, expected state (no one is watching); ignore.
            let _ = self.events.send(AvailabilityEvent {
                model_id: model_id.to_string(),
                job_type: job_type.to_string(),
                availability,
                changed,
            });
        }
    }

    /// Reports that a distributed allocation push changed local quotas for a model.
    pub async fn report_distributed_change(&self, model_id: &str, job_type: &str, availability: Availability) {
        let key = (model_id.to_string(), job_type.to_string());
        let mut last = self.last.lock().await;
        let prior = last.get(&key).copied();
        if prior == Some(availability) {
            return;
        }
        last.insert(key, availability);
        drop(last);
        let _ = self.events.send(AvailabilityEvent {
            model_id: model_id.to_string(),
            job_type: job_type.to_string(),
            availability,
            changed: ChangedDimension::Distributed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowSnapshot;

    fn snap(tpm_remaining: u64) -> ModelSnapshot {
        ModelSnapshot {
            model_id: "m".into(),
            tpm: Some(WindowSnapshot {
                reserved: 0,
                committed: 0,
                remaining: tpm_remaining,
                resets_in_ms: 0,
            }),
            rpm: None,
            tpd: None,
            rpd: None,
            in_flight: 0,
            max_concurrent: None,
        }
    }

    #[test]
    fn slots_is_floor_of_min_configured_dimension() {
        let availability = Availability::compute(&snap(950), Estimate { tokens: 100, requests: 1 }, None);
        assert_eq!(availability.slots, Some(9));
        assert_eq!(availability.tpm, Some(9));
        assert_eq!(availability.rpm, None, "unconfigured dimension stays None");
    }

    #[tokio::test]
    async fn repeated_equal_updates_are_suppressed() {
        let tracker = AvailabilityTracker::new(8);
        let mut rx = tracker.subscribe();

        let a = Availability::compute(&snap(950), Estimate { tokens: 100, requests: 1 }, None);
        tracker.update("m", "chat", a).await;
        let first = rx.try_recv().expect("first update always emits");
        assert_eq!(first.availability.slots, Some(9));

        tracker.update("m", "chat", a).await;
        assert!(rx.try_recv().is_err(), "unchanged availability must be suppressed");

        let b = Availability::compute(&snap(800), Estimate { tokens: 100, requests: 1 }, None);
        tracker.update("m", "chat", b).await;
        let second = rx.try_recv().expect("changed availability must emit");
        assert_eq!(second.changed, ChangedDimension::Tpm);
    }
}

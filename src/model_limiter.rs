//! Aggregates up to four [`CounterWindow`]s plus a concurrency semaphore for one model,
//! with atomic all-or-nothing reservation across every configured dimension.

use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::ModelConfig;
use crate::window::{CounterWindow, WindowSnapshot};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// The four rate dimensions a model may be limited on, checked in this fixed order so
/// two reservations racing on the same model see consistent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Tokens per minute.
    Tpm,
    /// Requests per minute.
    Rpm,
    /// Tokens per day.
    Tpd,
    /// Requests per day.
    Rpd,
}

impl Dimension {
    /// All dimensions, in the fixed check order: TPM, RPM, TPD, RPD.
    pub const ORDER: [Dimension; 4] = [Dimension::Tpm, Dimension::Rpm, Dimension::Tpd, Dimension::Rpd];
}

/// A per-instance quota update for one model, pushed down from the coordination client
/// after a RECOMPUTE.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerInstanceLimits {
    /// This instance's share of the model's tokens-per-minute budget.
    pub tokens_per_minute: Option<u64>,
    /// This instance's share of the model's requests-per-minute budget.
    pub requests_per_minute: Option<u64>,
    /// This instance's share of the model's tokens-per-day budget.
    pub tokens_per_day: Option<u64>,
    /// This instance's share of the model's requests-per-day budget.
    pub requests_per_day: Option<u64>,
    /// This instance's share of the model's concurrency budget.
    pub max_concurrent: Option<u64>,
}

struct Windows {
    tpm: Option<CounterWindow>,
    rpm: Option<CounterWindow>,
    tpd: Option<CounterWindow>,
    rpd: Option<CounterWindow>,
}

impl Windows {
    fn get_mut(&mut self, dim: Dimension) -> Option<&mut CounterWindow> {
        match dim {
            Dimension::Tpm => self.tpm.as_mut(),
            Dimension::Rpm => self.rpm.as_mut(),
            Dimension::Tpd => self.tpd.as_mut(),
            Dimension::Rpd => self.rpd.as_mut(),
        }
    }
}

/// A handle to a held reservation, bound to exactly one `(model, job)` pair.
///
/// Must be released exactly once, either via [`ModelLimiter::commit`] (the job ran) or
/// [`ModelLimiter::release_reservation`] (the job never ran). Releasing a reservation
/// twice, or committing one twice, is a programming error — it is not guarded against
/// at runtime for the same reason double-`free` isn't: the type is consumed by value on
/// both exit paths, so the borrow checker rules it out at compile time.
#[derive(Debug)]
pub struct Reservation {
    model_id: String,
    tokens: u64,
    requests: u64,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Reservation {
    /// The model this reservation is held against.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Estimated usage for one reservation attempt, the same value tried against every
/// model in the escalation order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Estimate {
    /// Estimated token usage.
    pub tokens: u64,
    /// Estimated request usage (almost always 1).
    pub requests: u64,
}

/// A snapshot of one model's limiter state, used by `getModelStats`.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    /// Model id this snapshot describes.
    pub model_id: String,
    /// Tokens-per-minute window state, if configured.
    pub tpm: Option<WindowSnapshot>,
    /// Requests-per-minute window state, if configured.
    pub rpm: Option<WindowSnapshot>,
    /// Tokens-per-day window state, if configured.
    pub tpd: Option<WindowSnapshot>,
    /// Requests-per-day window state, if configured.
    pub rpd: Option<WindowSnapshot>,
    /// Requests currently in flight on this model.
    pub in_flight: u64,
    /// Maximum concurrent requests allowed.
    pub max_concurrent: Option<u64>,
}

/// The per-model rate limiter.
pub struct ModelLimiter {
    model_id: String,
    windows: Mutex<Windows>,
    semaphore: Arc<Semaphore>,
    concurrency_limit: AtomicU64,
    in_flight: AtomicU64,
}

impl ModelLimiter {
    /// Builds a limiter for `config`, starting the windows at `now`/`now_epoch_ms`.
    pub fn new(config: &ModelConfig, now: Instant, now_epoch_ms: u64) -> Self {
        let max_concurrent = config.max_concurrent.unwrap_or(u64::MAX / 2);
        Self {
            model_id: config.id.clone(),
            windows: Mutex::new(Windows {
                tpm: config
                    .tokens_per_minute
                    .map(|l| CounterWindow::new(l, MINUTE, now, now_epoch_ms)),
                rpm: config
                    .requests_per_minute
                    .map(|l| CounterWindow::new(l, MINUTE, now, now_epoch_ms)),
                tpd: config
                    .tokens_per_day
                    .map(|l| CounterWindow::new(l, DAY, now, now_epoch_ms)),
                rpd: config
                    .requests_per_day
                    .map(|l| CounterWindow::new(l, DAY, now, now_epoch_ms)),
            }),
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            concurrency_limit: AtomicU64::new(max_concurrent),
            in_flight: AtomicU64::new(0),
        }
    }

    /// The model id this limiter serves.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Attempts an all-or-nothing reservation of `estimate` across every configured
    /// dimension. Checks concurrency first, then TPM, RPM, TPD, RPD in that fixed
    /// order; any failed check rolls back everything already held and returns `None`.
    pub async fn try_reserve(&self, estimate: Estimate, now: Instant) -> Option<Reservation> {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => return None,
        };

        let mut windows = self.windows.lock().await;
        let mut reserved_dims: Vec<Dimension> = Vec::with_capacity(4);

        let mut ok = true;
        for dim in Dimension::ORDER {
            let amount = match dim {
                Dimension::Tpm | Dimension::Tpd => estimate.tokens,
                Dimension::Rpm | Dimension::Rpd => estimate.requests,
            };
            if let Some(window) = windows.get_mut(dim) {
                if window.try_reserve(amount, now) {
                    reserved_dims.push(dim);
                } else {
                    ok = false;
                    break;
                }
            }
        }

        if !ok {
            for dim in reserved_dims {
                let amount = match dim {
                    Dimension::Tpm | Dimension::Tpd => estimate.tokens,
                    Dimension::Rpm | Dimension::Rpd => estimate.requests,
                };
                if let Some(window) = windows.get_mut(dim) {
                    window.release(amount, now);
                }
            }
            return None;
        }

        drop(windows);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(Reservation {
            model_id: self.model_id.clone(),
            tokens: estimate.tokens,
            requests: estimate.requests,
            _permit: permit,
        })
    }

    /// Releases a reservation that will never be committed (the job never ran).
    pub async fn release_reservation(&self, reservation: Reservation, now: Instant) {
        let mut windows = self.windows.lock().await;
        if let Some(w) = windows.get_mut(Dimension::Tpm) {
            w.release(reservation.tokens, now);
        }
        if let Some(w) = windows.get_mut(Dimension::Tpd) {
            w.release(reservation.tokens, now);
        }
        if let Some(w) = windows.get_mut(Dimension::Rpm) {
            w.release(reservation.requests, now);
        }
        if let Some(w) = windows.get_mut(Dimension::Rpd) {
            w.release(reservation.requests, now);
        }
        drop(windows);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        // `reservation._permit` is dropped here, returning the concurrency slot.
    }

    /// Commits a reservation's actual usage, replacing the provisional hold.
    pub async fn commit(&self, reservation: Reservation, actual_tokens: u64, actual_requests: u64, now: Instant) {
        let mut windows = self.windows.lock().await;
        if let Some(w) = windows.get_mut(Dimension::Tpm) {
            w.commit(actual_tokens, reservation.tokens, now);
        }
        if let Some(w) = windows.get_mut(Dimension::Tpd) {
            w.commit(actual_tokens, reservation.tokens, now);
        }
        if let Some(w) = windows.get_mut(Dimension::Rpm) {
            w.commit(actual_requests, reservation.requests, now);
        }
        if let Some(w) = windows.get_mut(Dimension::Rpd) {
            w.commit(actual_requests, reservation.requests, now);
        }
        drop(windows);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// A cheap, non-reserving predicate: would `estimate` currently fit? The answer can
    /// become stale immediately — callers must still attempt [`Self::try_reserve`] and
    /// handle rejection.
    pub async fn has_capacity(&self, estimate: Estimate, now: Instant) -> bool {
        if self.semaphore.available_permits() == 0 {
            return false;
        }
        let mut windows = self.windows.lock().await;
        Dimension::ORDER.iter().all(|&dim| {
            let amount = match dim {
                Dimension::Tpm | Dimension::Tpd => estimate.tokens,
                Dimension::Rpm | Dimension::Rpd => estimate.requests,
            };
            windows
                .get_mut(dim)
                .map_or(true, |w| w.has_capacity(amount, now))
        })
    }

    /// Applies a new per-instance quota pushed from the coordination client.
    ///
    /// Values currently reserved are not rescaled — rescaling in place could push a
    /// reservation above the new limit, violating `reserved <= limit`. Only subsequent
    /// `try_reserve` calls observe the new limit.
    pub async fn set_rate_limits(&self, limits: PerInstanceLimits) {
        let mut windows = self.windows.lock().await;
        if let (Some(w), Some(l)) = (windows.tpm.as_mut(), limits.tokens_per_minute) {
            w.set_limit(l);
        }
        if let (Some(w), Some(l)) = (windows.rpm.as_mut(), limits.requests_per_minute) {
            w.set_limit(l);
        }
        if let (Some(w), Some(l)) = (windows.tpd.as_mut(), limits.tokens_per_day) {
            w.set_limit(l);
        }
        if let (Some(w), Some(l)) = (windows.rpd.as_mut(), limits.requests_per_day) {
            w.set_limit(l);
        }
        drop(windows);

        if let Some(new_limit) = limits.max_concurrent {
            let old_limit = self.concurrency_limit.swap(new_limit, Ordering::SeqCst);
            match new_limit.cmp(&old_limit) {
                cmp::Ordering::Greater => {
                    self.semaphore
                        .add_permits((new_limit - old_limit) as usize);
                }
                cmp::Ordering::Less => {
                    let semaphore = Arc::clone(&self.semaphore);
                    let to_remove = (old_limit - new_limit) as u32;
                    tokio::spawn(async move {
                        if let Ok(permits) = semaphore.acquire_many_owned(to_remove).await {
                            permits.forget();
                        }
                    });
                }
                cmp::Ordering::Equal => {}
            }
        }
    }

    /// A point-in-time snapshot of this model's windows and concurrency.
    pub async fn snapshot(&self, now: Instant) -> ModelSnapshot {
        let mut windows = self.windows.lock().await;
        ModelSnapshot {
            model_id: self.model_id.clone(),
            tpm: windows.tpm.as_mut().map(|w| w.snapshot(now)),
            rpm: windows.rpm.as_mut().map(|w| w.snapshot(now)),
            tpd: windows.tpd.as_mut().map(|w| w.snapshot(now)),
            rpd: windows.rpd.as_mut().map(|w| w.snapshot(now)),
            in_flight: self.in_flight.load(Ordering::Acquire),
            max_concurrent: {
                let limit = self.concurrency_limit.load(Ordering::Acquire);
                (limit < u64::MAX / 2).then_some(limit)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pricing;

    fn model(rpm: Option<u64>, tpm: Option<u64>, max_concurrent: Option<u64>) -> ModelConfig {
        ModelConfig {
            id: "m".into(),
            requests_per_minute: rpm,
            requests_per_day: None,
            tokens_per_minute: tpm,
            tokens_per_day: None,
            max_concurrent,
            pricing: Pricing {
                input: 1.0,
                cached: 0.5,
                output: 2.0,
            },
        }
    }

    #[tokio::test]
    async fn all_or_nothing_across_dimensions() {
        let now = Instant::now();
        let limiter = ModelLimiter::new(&model(Some(5), Some(10), None), now, 0);

        // RPM allows 5, but TPM only allows one reservation of 10 tokens.
        let r1 = limiter
            .try_reserve(Estimate { tokens: 10, requests: 1 }, now)
            .await
            .expect("first reservation should succeed");

        let r2 = limiter
            .try_reserve(Estimate { tokens: 10, requests: 1 }, now)
            .await;
        assert!(r2.is_none(), "TPM exhausted, RPM still has room — must roll back");

        let snap = limiter.snapshot(now).await;
        assert_eq!(snap.rpm.unwrap().reserved, 1, "rolled-back RPM reservation must not leak");

        limiter.release_reservation(r1, now).await;
    }

    #[tokio::test]
    async fn concurrency_gates_independently_of_counters() {
        let now = Instant::now();
        let limiter = ModelLimiter::new(&model(None, None, Some(1)), now, 0);

        let r1 = limiter
            .try_reserve(Estimate { tokens: 1, requests: 1 }, now)
            .await
            .unwrap();
        assert!(
            limiter
                .try_reserve(Estimate { tokens: 1, requests: 1 }, now)
                .await
                .is_none(),
            "concurrency slot exhausted"
        );
        limiter.release_reservation(r1, now).await;
        assert!(limiter
            .try_reserve(Estimate { tokens: 1, requests: 1 }, now)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn set_rate_limits_does_not_rescale_in_flight() {
        let now = Instant::now();
        let limiter = ModelLimiter::new(&model(Some(10), None, None), now, 0);
        let r1 = limiter
            .try_reserve(Estimate { tokens: 0, requests: 8 }, now)
            .await
            .unwrap();

        limiter
            .set_rate_limits(PerInstanceLimits {
                requests_per_minute: Some(5),
                ..Default::default()
            })
            .await;

        let snap = limiter.snapshot(now).await;
        assert_eq!(snap.rpm.unwrap().reserved, 8, "existing reservation is untouched");

        limiter.release_reservation(r1, now).await;
        assert!(
            !limiter
                .has_capacity(Estimate { tokens: 0, requests: 6 }, now)
                .await,
            "new limit of 5 applies to subsequent reservations"
        );
    }
}

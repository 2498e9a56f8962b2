//! The reference, single-process realization of [`Coordinator`].
//!
//! Every operation locks one [`tokio::sync::Mutex`] around the whole coordination
//! state, which trivially satisfies "executes as a single serialized step" for any
//! back-end offering serializable transactions — this is the degenerate case where the
//! transaction is a mutex guard instead of a round trip. It is what the test suite and
//! any single-process deployment run against; [`super::redis::RedisCoordinator`] is the
//! multi-process realization using the same protocol.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::config::{LimiterConfig, ModelConfig};
use crate::error::LimiterError;
use crate::model_limiter::Dimension;

use super::{Allocation, Coordinator, InstanceInfo, ModelPool};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// A running sum over a sliding window, used centrally to track `Σ actuals` per
/// `(model, dimension)` for RECOMPUTE. Unlike [`crate::window::CounterWindow`] this
/// tracks no reservation — the coordinator only ever sees committed (actual) usage.
struct RollingSum {
    window: Duration,
    window_start: Instant,
    sum: u64,
}

impl RollingSum {
    fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            window_start: now,
            sum: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.window_start + self.window {
            let window_ms = self.window.as_millis().max(1) as u64;
            let elapsed_ms = (now - self.window_start).as_millis() as u64;
            let windows_elapsed = (elapsed_ms / window_ms).max(1);
            self.window_start += self.window * windows_elapsed as u32;
            self.sum = 0;
        }
    }

    fn add(&mut self, now: Instant, amount: u64) {
        self.roll(now);
        self.sum += amount;
    }

    fn get(&mut self, now: Instant) -> u64 {
        self.roll(now);
        self.sum
    }
}

struct InstanceState {
    last_heartbeat: Instant,
    in_flight_by_model: HashMap<String, u64>,
}

struct State {
    instances: HashMap<String, InstanceState>,
    allocations: HashMap<String, Allocation>,
    minute_usage: HashMap<(String, Dimension), RollingSum>,
    day_usage: HashMap<(String, Dimension), RollingSum>,
    /// Monotonically increasing counter, bumped once per RECOMPUTE; `Allocation::sequence`
    /// carries this so a client can detect an out-of-order push regardless of whether
    /// membership grew or shrank between the two.
    sequence: u64,
}

/// The RECOMPUTE algorithm lives here; the per-instance client side is
/// [`super::CoordinationClient`], which talks to any [`Coordinator`] including this one.
pub struct InMemoryCoordinator {
    model_configs: HashMap<String, ModelConfig>,
    avg_estimated_tokens: f64,
    avg_estimated_requests: f64,
    default_pool_size: u64,
    state: Mutex<State>,
    senders: StdMutex<HashMap<String, broadcast::Sender<Allocation>>>,
}

impl InMemoryCoordinator {
    /// Builds a coordinator from the static model/job-type configuration.
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            model_configs: config.models.clone(),
            avg_estimated_tokens: config.avg_estimated_tokens(),
            avg_estimated_requests: config.avg_estimated_requests(),
            default_pool_size: config.tunables.default_pool_size,
            state: Mutex::new(State {
                instances: HashMap::new(),
                allocations: HashMap::new(),
                minute_usage: HashMap::new(),
                day_usage: HashMap::new(),
                sequence: 0,
            }),
            senders: StdMutex::new(HashMap::new()),
        }
    }

    fn recompute(&self, state: &mut State, now: Instant) -> Allocation {
        state.sequence += 1;
        let sequence = state.sequence;
        let n = state.instances.len().max(1) as u64;
        let mut pools = HashMap::with_capacity(self.model_configs.len());

        for (model_id, cfg) in &self.model_configs {
            let remaining_for = |dim: Dimension, limit: Option<u64>, usage: &mut HashMap<(String, Dimension), RollingSum>, window: Duration| {
                limit.map(|l| {
                    let sum = usage
                        .entry((model_id.clone(), dim))
                        .or_insert_with(|| RollingSum::new(window, now))
                        .get(now);
                    l.saturating_sub(sum)
                })
            };

            let tpm_remaining = remaining_for(Dimension::Tpm, cfg.tokens_per_minute, &mut state.minute_usage, MINUTE);
            let rpm_remaining = remaining_for(Dimension::Rpm, cfg.requests_per_minute, &mut state.minute_usage, MINUTE);
            let tpd_remaining = remaining_for(Dimension::Tpd, cfg.tokens_per_day, &mut state.day_usage, DAY);
            let rpd_remaining = remaining_for(Dimension::Rpd, cfg.requests_per_day, &mut state.day_usage, DAY);

            let per_instance_tpm = tpm_remaining.map(|r| r / n);
            let per_instance_rpm = rpm_remaining.map(|r| r / n);
            let per_instance_tpd = tpd_remaining.map(|r| r / n);
            let per_instance_rpd = rpd_remaining.map(|r| r / n);

            let mut candidates: Vec<u64> = Vec::with_capacity(5);
            if let Some(mc) = cfg.max_concurrent {
                candidates.push(mc / n);
            }
            if let Some(p) = per_instance_tpm {
                candidates.push((p as f64 / self.avg_estimated_tokens).floor() as u64);
            }
            if let Some(p) = per_instance_rpm {
                candidates.push((p as f64 / self.avg_estimated_requests).floor() as u64);
            }
            if let Some(p) = per_instance_tpd {
                candidates.push((p as f64 / self.avg_estimated_tokens).floor() as u64);
            }
            if let Some(p) = per_instance_rpd {
                candidates.push((p as f64 / self.avg_estimated_requests).floor() as u64);
            }

            let total_slots = candidates.into_iter().min().unwrap_or(self.default_pool_size);

            pools.insert(
                model_id.clone(),
                ModelPool {
                    total_slots,
                    tokens_per_minute: per_instance_tpm,
                    requests_per_minute: per_instance_rpm,
                    tokens_per_day: per_instance_tpd,
                    requests_per_day: per_instance_rpd,
                },
            );
        }

        Allocation {
            instance_count: n,
            sequence,
            pools,
        }
    }

    fn publish_to_all(&self, state: &mut State, allocation: &Allocation) {
        for instance_id in state.instances.keys() {
            state
                .allocations
                .insert(instance_id.clone(), allocation.clone());
        }
        let senders = self.senders.lock().expect("senders mutex poisoned");
        for (instance_id, sender) in senders.iter() {
            if state.instances.contains_key(instance_id) {
                let _ = sender.send(allocation.clone());
            }
        }
    }

    fn get_or_create_sender(&self, instance_id: &str) -> broadcast::Sender<Allocation> {
        let mut senders = self.senders.lock().expect("senders mutex poisoned");
        senders
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(32).0)
            .clone()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn register(&self, instance_id: &str) -> Result<Allocation, LimiterError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.instances.insert(
            instance_id.to_string(),
            InstanceState {
                last_heartbeat: now,
                in_flight_by_model: HashMap::new(),
            },
        );
        self.get_or_create_sender(instance_id);

        let allocation = self.recompute(&mut state, now);
        self.publish_to_all(&mut state, &allocation);
        tracing::info!(instance_id, "registered with coordinator");
        Ok(state
            .allocations
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn unregister(&self, instance_id: &str) -> Result<(), LimiterError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.instances.remove(instance_id);
        state.allocations.remove(instance_id);
        self.senders.lock().expect("senders mutex poisoned").remove(instance_id);

        let allocation = self.recompute(&mut state, now);
        self.publish_to_all(&mut state, &allocation);
        tracing::info!(instance_id, "unregistered from coordinator");
        Ok(())
    }

    async fn acquire(&self, instance_id: &str, model_id: &str) -> Result<bool, LimiterError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let Some(allocation) = state.allocations.get_mut(instance_id) else {
            return Ok(false);
        };
        let Some(pool) = allocation.pools.get_mut(model_id) else {
            return Ok(false);
        };
        if pool.total_slots == 0 {
            return Ok(false);
        }
        pool.total_slots -= 1;

        if let Some(instance) = state.instances.get_mut(instance_id) {
            *instance.in_flight_by_model.entry(model_id.to_string()).or_insert(0) += 1;
            instance.last_heartbeat = now;
        }
        Ok(true)
    }

    async fn release(
        &self,
        instance_id: &str,
        model_id: &str,
        actual_tokens: u64,
        actual_requests: u64,
    ) -> Result<(), LimiterError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if let Some(instance) = state.instances.get_mut(instance_id) {
            if let Some(count) = instance.in_flight_by_model.get_mut(model_id) {
                *count = count.saturating_sub(1);
            }
        }

        state
            .minute_usage
            .entry((model_id.to_string(), Dimension::Tpm))
            .or_insert_with(|| RollingSum::new(MINUTE, now))
            .add(now, actual_tokens);
        state
            .minute_usage
            .entry((model_id.to_string(), Dimension::Rpm))
            .or_insert_with(|| RollingSum::new(MINUTE, now))
            .add(now, actual_requests);
        state
            .day_usage
            .entry((model_id.to_string(), Dimension::Tpd))
            .or_insert_with(|| RollingSum::new(DAY, now))
            .add(now, actual_tokens);
        state
            .day_usage
            .entry((model_id.to_string(), Dimension::Rpd))
            .or_insert_with(|| RollingSum::new(DAY, now))
            .add(now, actual_requests);

        let allocation = self.recompute(&mut state, now);
        self.publish_to_all(&mut state, &allocation);
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<(), LimiterError> {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.last_heartbeat = Instant::now();
        }
        Ok(())
    }

    async fn cleanup(&self, max_age: Duration) -> Result<(), LimiterError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let stale: Vec<String> = state
            .instances
            .iter()
            .filter(|(_, inst)| now.saturating_duration_since(inst.last_heartbeat) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        if stale.is_empty() {
            return Ok(());
        }

        for id in &stale {
            tracing::warn!(instance_id = id.as_str(), "evicting stale instance");
            state.instances.remove(id);
            state.allocations.remove(id);
            self.senders.lock().expect("senders mutex poisoned").remove(id);
        }

        let allocation = self.recompute(&mut state, now);
        self.publish_to_all(&mut state, &allocation);
        Ok(())
    }

    fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<Allocation> {
        self.get_or_create_sender(instance_id).subscribe()
    }

    async fn instances(&self) -> Vec<InstanceInfo> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .instances
            .iter()
            .map(|(id, inst)| InstanceInfo {
                instance_id: id.clone(),
                ms_since_heartbeat: now.saturating_duration_since(inst.last_heartbeat).as_millis() as u64,
                in_flight_by_model: inst.in_flight_by_model.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobTypeConfig, Pricing, Tunables};

    fn test_config() -> LimiterConfig {
        let mut models = HashMap::new();
        models.insert(
            "m1".to_string(),
            ModelConfig {
                id: "m1".into(),
                requests_per_minute: None,
                requests_per_day: None,
                tokens_per_minute: Some(10_000),
                tokens_per_day: None,
                max_concurrent: None,
                pricing: Pricing { input: 1.0, cached: 0.5, output: 2.0 },
            },
        );
        let mut job_types = HashMap::new();
        job_types.insert(
            "chat".to_string(),
            JobTypeConfig {
                id: "chat".into(),
                estimated_tokens: 1000,
                estimated_requests: 1,
                estimated_memory_kb: 0,
                initial_ratio: 1.0,
                flexible: false,
                min_capacity: None,
                max_capacity: None,
            },
        );
        LimiterConfig {
            models,
            job_types,
            escalation_order: vec!["m1".into()],
            memory_budget_kb: 1_000_000,
            tunables: Tunables::default(),
            coordination_prefix: "test:".into(),
        }
    }

    #[tokio::test]
    async fn register_then_unregister_restores_instance_count() {
        let coord = InMemoryCoordinator::new(&test_config());
        let a1 = coord.register("i1").await.unwrap();
        assert_eq!(a1.instance_count, 1);

        let a2 = coord.register("i2").await.unwrap();
        assert_eq!(a2.instance_count, 2);
        assert!(
            a2.pools["m1"].total_slots <= a1.pools["m1"].total_slots,
            "a second instance should not get more slots than the first had alone"
        );

        coord.unregister("i2").await.unwrap();
        let remaining = coord.instances().await;
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn acquire_decrements_and_release_is_visible_to_recompute() {
        let coord = InMemoryCoordinator::new(&test_config());
        coord.register("i1").await.unwrap();

        assert!(coord.acquire("i1", "m1").await.unwrap());
        let instances = coord.instances().await;
        assert_eq!(instances[0].in_flight_by_model["m1"], 1);

        coord.release("i1", "m1", 1000, 1).await.unwrap();
        let instances = coord.instances().await;
        assert_eq!(instances[0].in_flight_by_model["m1"], 0);
    }

    #[tokio::test]
    async fn two_instances_each_get_bounded_pool_for_shared_tpm() {
        let coord = InMemoryCoordinator::new(&test_config());
        let a1 = coord.register("i1").await.unwrap();
        let a2 = coord.register("i2").await.unwrap();

        // TPM=10000, estimate=1000 tokens/job, N=2 -> perInstance=5000 -> pool<=5.
        assert!(a1.pools["m1"].total_slots <= 5);
        assert!(a2.pools["m1"].total_slots <= 5);

        let mut i1_updates = coord.subscribe("i1");
        coord.unregister("i2").await.unwrap();
        let instances = coord.instances().await;
        assert_eq!(instances.len(), 1);

        // With i2 gone, i1 alone gets the full TPM=10000 -> pool<=10.
        let after_unregister = i1_updates.recv().await.unwrap();
        assert!(after_unregister.pools["m1"].total_slots <= 10);
        assert!(after_unregister.pools["m1"].total_slots > a1.pools["m1"].total_slots);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_evicts_stale_instances() {
        let coord = InMemoryCoordinator::new(&test_config());
        coord.register("i1").await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        coord.cleanup(Duration::from_secs(15)).await.unwrap();

        assert!(coord.instances().await.is_empty());
    }
}

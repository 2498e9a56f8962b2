//! The per-instance coordination client — joins, heartbeats, and applies pushed
//! allocations to the local model limiters and job-type pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Tunables;
use crate::error::LimiterError;
use crate::job_type::JobTypeManager;
use crate::model_limiter::{ModelLimiter, PerInstanceLimits};

use super::{Allocation, Coordinator, InstanceInfo};

/// Wraps a [`Coordinator`] with the per-instance behavior layered on top of the bare
/// protocol: joining, heartbeating, and applying pushed allocations to the local
/// [`ModelLimiter`]s and [`JobTypeManager`] with the stale-allocation guard.
pub struct CoordinationClient {
    instance_id: String,
    coordinator: Arc<dyn Coordinator>,
    model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
    job_types: Arc<JobTypeManager>,
    heartbeat_interval: Duration,
    stale_instance_timeout: Duration,
    max_sequence_applied: AtomicU64,
    last_allocation: Mutex<Allocation>,
}

impl CoordinationClient {
    /// Builds a client for `instance_id`, talking to `coordinator`, applying pushed
    /// allocations to `model_limiters` and `job_types`.
    pub fn new(
        instance_id: impl Into<String>,
        coordinator: Arc<dyn Coordinator>,
        model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
        job_types: Arc<JobTypeManager>,
        tunables: &Tunables,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            coordinator,
            model_limiters,
            job_types,
            heartbeat_interval: tunables.heartbeat_interval,
            stale_instance_timeout: tunables.stale_instance_timeout,
            max_sequence_applied: AtomicU64::new(0),
            last_allocation: Mutex::new(Allocation::default()),
        }
    }

    /// This instance's id, as registered with the coordinator.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The most recently applied allocation, for `getAllocation`.
    pub async fn current_allocation(&self) -> Allocation {
        self.last_allocation.lock().await.clone()
    }

    /// Every instance the coordination back end currently has registered, for
    /// `getStats`/debugging.
    pub async fn instances(&self) -> Vec<InstanceInfo> {
        self.coordinator.instances().await
    }

    /// REGISTER with the coordinator and apply the returned initial allocation.
    pub async fn join(&self) -> Result<(), LimiterError> {
        let allocation = self.coordinator.register(&self.instance_id).await?;
        tracing::info!(instance_id = %self.instance_id, "joined coordination");
        self.apply(allocation).await;
        Ok(())
    }

    /// UNREGISTER from the coordinator. Does not touch local limiter state — a departing
    /// instance keeps serving whatever it last held until process shutdown completes.
    pub async fn leave(&self) -> Result<(), LimiterError> {
        self.coordinator.unregister(&self.instance_id).await
    }

    /// ACQUIRE a remote slot for `model_id`, on behalf of the delegation executor.
    pub async fn acquire(&self, model_id: &str) -> Result<bool, LimiterError> {
        self.coordinator.acquire(&self.instance_id, model_id).await
    }

    /// RELEASE a remote slot for `model_id`, reporting the actual usage charged to it.
    pub async fn release(&self, model_id: &str, actual_tokens: u64, actual_requests: u64) -> Result<(), LimiterError> {
        self.coordinator
            .release(&self.instance_id, model_id, actual_tokens, actual_requests)
            .await
    }

    /// Spawns the heartbeat loop, the allocation-subscription loop, and the periodic
    /// CLEANUP sweep, all running until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_heartbeat_loop(cancel.clone()),
            self.spawn_subscribe_loop(cancel.clone()),
            self.spawn_cleanup_loop(cancel),
        ]
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let interval_duration = client.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(instance_id = %client.instance_id, "heartbeat loop stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = client.coordinator.heartbeat(&client.instance_id).await {
                            tracing::warn!(instance_id = %client.instance_id, %err, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_subscribe_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut receiver = client.coordinator.subscribe(&client.instance_id);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(instance_id = %client.instance_id, "allocation subscription stopping");
                        break;
                    }
                    message = receiver.recv() => {
                        match message {
                            Ok(allocation) => client.apply(allocation).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(instance_id = %client.instance_id, skipped, "allocation subscriber lagged, dropped pushes");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    /// Spawns the periodic cleanup sweep, running every few heartbeat intervals,
    /// evicting instances whose heartbeat has gone stale.
    fn spawn_cleanup_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let tick = client.heartbeat_interval * 3;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(instance_id = %client.instance_id, "cleanup loop stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = client.coordinator.cleanup(client.stale_instance_timeout).await {
                            tracing::warn!(instance_id = %client.instance_id, %err, "cleanup sweep failed");
                        }
                    }
                }
            }
        })
    }

    /// Applies a pushed allocation: per-model quota updates, and a combined local
    /// capacity fed to the job-type manager. Division by job type stays local — ratios
    /// never cross the coordination boundary, only the pool-size sum does.
    ///
    /// Guards against an out-of-order push with `allocation.sequence`, not
    /// `instance_count` — membership legitimately shrinks (an instance leaves) as often
    /// as it grows, so the pool size a push carries is not itself ordered; only the
    /// coordinator's own RECOMPUTE counter is.
    async fn apply(&self, allocation: Allocation) {
        let previously_applied = self
            .max_sequence_applied
            .fetch_max(allocation.sequence, Ordering::AcqRel);
        if allocation.sequence < previously_applied {
            tracing::debug!(
                instance_id = %self.instance_id,
                sequence = allocation.sequence,
                previously_applied,
                "ignoring stale allocation"
            );
            return;
        }

        *self.last_allocation.lock().await = allocation.clone();

        let mut total_slots: u64 = 0;
        for (model_id, pool) in &allocation.pools {
            if let Some(limiter) = self.model_limiters.get(model_id) {
                limiter
                    .set_rate_limits(PerInstanceLimits {
                        tokens_per_minute: pool.tokens_per_minute,
                        requests_per_minute: pool.requests_per_minute,
                        tokens_per_day: pool.tokens_per_day,
                        requests_per_day: pool.requests_per_day,
                        max_concurrent: Some(pool.total_slots),
                    })
                    .await;
            } else {
                tracing::warn!(model_id, "allocation references a model with no local limiter");
            }
            total_slots = total_slots.saturating_add(pool.total_slots);
        }

        self.job_types.set_capacity(total_slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobTypeConfig, LimiterConfig, ModelConfig, Pricing};
    use crate::coordination::memory::InMemoryCoordinator;
    use tokio::time::Instant;

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
                estimated_tokens: 500,
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
            tunables: Tunables {
                heartbeat_interval: Duration::from_millis(10),
                ..Default::default()
            },
            coordination_prefix: "test:".into(),
        }
    }

    fn build_client(coordinator: Arc<dyn Coordinator>, config: &LimiterConfig, instance_id: &str) -> Arc<CoordinationClient> {
        let now = Instant::now();
        let mut model_limiters = HashMap::new();
        for model in config.models.values() {
            model_limiters.insert(model.id.clone(), Arc::new(ModelLimiter::new(model, now, 0)));
        }
        let job_types = Arc::new(JobTypeManager::new(&config.job_types, &config.tunables, 0));
        Arc::new(CoordinationClient::new(
            instance_id,
            coordinator,
            Arc::new(model_limiters),
            job_types,
            &config.tunables,
        ))
    }

    #[tokio::test]
    async fn join_applies_initial_allocation_to_model_limiter() {
        let config = test_config();
        let coordinator: Arc<dyn Coordinator> = Arc::new(InMemoryCoordinator::new(&config));
        let client = build_client(Arc::clone(&coordinator), &config, "i1");

        client.join().await.unwrap();

        let snapshot = client.model_limiters["m1"].snapshot(Instant::now()).await;
        assert!(snapshot.tpm.unwrap().remaining <= 10_000, "per-instance share must not exceed the model total");
    }

    #[tokio::test]
    async fn stale_allocation_with_smaller_sequence_is_ignored() {
        let config = test_config();
        let coordinator: Arc<dyn Coordinator> = Arc::new(InMemoryCoordinator::new(&config));
        let client = build_client(Arc::clone(&coordinator), &config, "i1");
        client.join().await.unwrap();

        // A later RECOMPUTE push, sequence 5, must be accepted.
        let newer = Allocation {
            instance_count: 2,
            sequence: 5,
            pools: HashMap::new(),
        };
        client.apply(newer).await;
        assert_eq!(client.max_sequence_applied.load(Ordering::Acquire), 5);

        // A late-arriving push with an earlier sequence number must be dropped, even
        // though its instance_count is smaller and would otherwise look legitimate.
        let stale = Allocation {
            instance_count: 1,
            sequence: 3,
            pools: HashMap::new(),
        };
        client.apply(stale).await;
        assert_eq!(
            client.max_sequence_applied.load(Ordering::Acquire),
            5,
            "an earlier sequence number must never move the watermark backwards"
        );
    }

    #[tokio::test]
    async fn a_real_membership_decrease_is_still_applied() {
        let config = test_config();
        let coordinator: Arc<dyn Coordinator> = Arc::new(InMemoryCoordinator::new(&config));
        let client = build_client(Arc::clone(&coordinator), &config, "i1");
        client.join().await.unwrap();

        // Two instances share the budget: instance_count goes up, sequence goes up too.
        let two_instances = Allocation {
            instance_count: 2,
            sequence: 2,
            pools: HashMap::new(),
        };
        client.apply(two_instances).await;

        // The second instance leaves: instance_count drops back to 1, but this is a
        // newer RECOMPUTE (higher sequence), so it must still be applied.
        let one_instance = Allocation {
            instance_count: 1,
            sequence: 3,
            pools: HashMap::new(),
        };
        client.apply(one_instance).await;
        assert_eq!(
            client.current_allocation().await.instance_count,
            1,
            "a genuine membership decrease must be applied even though instance_count went down"
        );
    }
}

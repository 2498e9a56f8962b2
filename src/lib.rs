//! Distributed, multi-model rate limiter and job dispatcher with escalation-based
//! failover.
//!
//! [`Limiter`] is the facade: it owns one [`model_limiter::ModelLimiter`] per
//! configured model, a [`job_type::JobTypeManager`] partitioning local capacity across
//! job types, a [`memory::MemoryManager`] for the process-wide memory budget, a
//! [`coordination::CoordinationClient`] talking to a pluggable [`coordination::Coordinator`]
//! back end, and an [`executor::DelegationExecutor`] that drives each job through
//! reservation, dispatch, and escalation.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod availability;
pub mod config;
pub mod coordination;
pub mod error;
pub mod executor;
pub mod job_type;
pub mod memory;
pub mod model_limiter;
pub mod stats;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use conv::ConvAsUtil;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use config::LimiterConfig;
pub use coordination::{Allocation, Coordinator};
pub use error::LimiterError;
pub use executor::{Job, JobContext, JobOutcome, JobRunContext, Outcome, UsageEntry, UsageReport};
pub use model_limiter::Estimate;

use availability::AvailabilityTracker;
use coordination::CoordinationClient;
use executor::DelegationExecutor;
use job_type::JobTypeManager;
use memory::MemoryManager;
use model_limiter::ModelLimiter;
use stats::{ActiveJob, Stats};

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The top-level handle: build one per process, [`Self::start`] it, dispatch jobs
/// through [`Self::queue_job`]/[`Self::queue_job_for_model`], and [`Self::stop`] it on
/// shutdown.
pub struct Limiter {
    config: Arc<LimiterConfig>,
    model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
    job_types: Arc<JobTypeManager>,
    memory: Arc<MemoryManager>,
    availability: Arc<AvailabilityTracker>,
    coordination: Arc<CoordinationClient>,
    executor: Arc<DelegationExecutor>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Limiter {
    /// Builds a limiter over `config`, dispatching remote coordination through
    /// `coordinator` under `instance_id`.
    ///
    /// Validates and normalizes `config` (see [`LimiterConfig::validate_and_normalize`]).
    /// Registering with `coordinator` and starting background tasks happens in
    /// [`Self::start`], not here.
    pub fn new(mut config: LimiterConfig, coordinator: Arc<dyn Coordinator>, instance_id: impl Into<String>) -> Self {
        config.validate_and_normalize();
        let config = Arc::new(config);

        let now = Instant::now();
        let now_epoch_ms = now_epoch_ms();

        let mut model_limiters = HashMap::with_capacity(config.models.len());
        for model in config.models.values() {
            model_limiters.insert(model.id.clone(), Arc::new(ModelLimiter::new(model, now, now_epoch_ms)));
        }
        let model_limiters = Arc::new(model_limiters);

        let job_types = Arc::new(JobTypeManager::new(
            &config.job_types,
            &config.tunables,
            config.tunables.default_pool_size,
        ));
        let memory = Arc::new(MemoryManager::new(config.memory_budget_kb));
        let availability = Arc::new(AvailabilityTracker::new(256));

        let coordination = Arc::new(CoordinationClient::new(
            instance_id,
            coordinator,
            Arc::clone(&model_limiters),
            Arc::clone(&job_types),
            &config.tunables,
        ));

        let executor = Arc::new(DelegationExecutor::new(
            Arc::clone(&config),
            Arc::clone(&model_limiters),
            Arc::clone(&job_types),
            Arc::clone(&memory),
            Arc::clone(&coordination),
            Arc::clone(&availability),
        ));

        Self {
            config,
            model_limiters,
            job_types,
            memory,
            availability,
            coordination,
            executor,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers with the coordination back end, applies the initial allocation it
    /// returns, and starts every background task: the ratio-adjustment loop and the
    /// coordination client's heartbeat, subscription, and cleanup loops.
    pub async fn start(&self) -> Result<(), LimiterError> {
        self.coordination.join().await?;

        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = self.job_types.start(self.cancel.clone()) {
            tasks.push(handle);
        }
        tasks.extend(self.coordination.start(self.cancel.clone()));
        Ok(())
    }

    /// Cancels every background task and waits for them to finish, then unregisters
    /// from the coordination back end.
    ///
    /// Does not cancel in-flight [`Self::queue_job`] calls — callers drive those with
    /// their own [`CancellationToken`] and are responsible for shutting them down first.
    pub async fn stop(&self) -> Result<(), LimiterError> {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.coordination.leave().await
    }

    /// Dispatches `job` under `job_type`, reserving local and remote capacity on each
    /// model tried and escalating through the configured order on rejection or
    /// delegation.
    pub async fn queue_job<D, J>(
        &self,
        job_id: impl Into<String>,
        job_type: &str,
        job: J,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome<D>, LimiterError>
    where
        D: Send,
        J: Job<D>,
    {
        self.executor.queue_job(job_id, job_type, job, cancel).await
    }

    /// Dispatches `job` directly to `model_id`, bypassing job-type accounting and
    /// escalation entirely. A `Delegate` outcome is treated as a plain rejection — see
    /// [`executor::DelegationExecutor::queue_job_for_model`].
    pub async fn queue_job_for_model<D, J>(
        &self,
        job_id: impl Into<String>,
        model_id: &str,
        estimate: Estimate,
        job: J,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome<D>, LimiterError>
    where
        D: Send,
        J: Job<D>,
    {
        self.executor
            .queue_job_for_model(job_id, model_id, estimate, job, cancel)
            .await
    }

    /// Whether any configured model currently has capacity for the average job-type
    /// estimate. A coarse, cheap predicate — [`Self::has_capacity_for_model`] is
    /// precise for one model, and the answer can go stale the instant it's returned.
    pub async fn has_capacity(&self) -> bool {
        let now = Instant::now();
        let estimate = self.average_estimate();
        for limiter in self.model_limiters.values() {
            if limiter.has_capacity(estimate, now).await {
                return true;
            }
        }
        false
    }

    /// Whether `model_id` currently has capacity for the average job-type estimate.
    /// Returns `false` for an unconfigured model id.
    pub async fn has_capacity_for_model(&self, model_id: &str) -> bool {
        let Some(limiter) = self.model_limiters.get(model_id) else {
            return false;
        };
        limiter.has_capacity(self.average_estimate(), Instant::now()).await
    }

    /// Whether `job_type` currently has a free slot in its local pool.
    pub fn has_capacity_for_job_type(&self, job_type: &str) -> bool {
        self.job_types.has_capacity(job_type)
    }

    fn average_estimate(&self) -> Estimate {
        Estimate {
            tokens: self
                .config
                .avg_estimated_tokens()
                .ceil()
                .approx()
                .expect("average estimate should be clamped within u64 bounds"),
            requests: self
                .config
                .avg_estimated_requests()
                .ceil()
                .approx()
                .expect("average estimate should be clamped within u64 bounds"),
        }
    }

    /// The cross-component snapshot: every model's window state, every job type's pool
    /// state, registered instances, active jobs, and memory usage.
    pub async fn get_stats(&self) -> Stats {
        let now = Instant::now();
        let mut models = Vec::with_capacity(self.model_limiters.len());
        for limiter in self.model_limiters.values() {
            models.push(limiter.snapshot(now).await);
        }
        Stats {
            models,
            job_types: self.job_types.snapshot(),
            instances: self.coordination.instances().await,
            active_jobs: self.executor.active_jobs().await,
            memory_used_kb: self.memory.total_used_kb(),
            memory_budget_kb: self.memory.budget_kb(),
        }
    }

    /// The snapshot for one model, or `None` if `model_id` isn't configured.
    pub async fn get_model_stats(&self, model_id: &str) -> Option<model_limiter::ModelSnapshot> {
        let limiter = self.model_limiters.get(model_id)?;
        Some(limiter.snapshot(Instant::now()).await)
    }

    /// The pool snapshot for every configured job type.
    pub fn get_job_type_stats(&self) -> Vec<job_type::JobTypeSnapshot> {
        self.job_types.snapshot()
    }

    /// Every job currently in flight on this instance.
    pub async fn get_active_jobs(&self) -> Vec<ActiveJob> {
        self.executor.active_jobs().await
    }

    /// This instance's most recently applied allocation: its per-model pools and the
    /// instance count RECOMPUTE used to derive them.
    pub async fn get_allocation(&self) -> Allocation {
        self.coordination.current_allocation().await
    }
}

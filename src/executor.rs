//! The delegation executor — per-job state machine.
//!
//! States: `CREATED -> WAITING_JOB_TYPE -> SELECTING -> RESERVED_LOCAL -> RESERVED_REMOTE
//! -> RUNNING -> {COMPLETED | DELEGATING | FAILED}`. Delegation is modeled as a tagged
//! return value rather than exception-based control flow: the user job returns an
//! [`Outcome`] instead of throwing or calling a reject callback.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::availability::AvailabilityTracker;
use crate::config::LimiterConfig;
use crate::coordination::CoordinationClient;
use crate::error::{abort_unknown_model, LimiterError};
use crate::job_type::JobTypeManager;
use crate::memory::MemoryManager;
use crate::model_limiter::{Estimate, ModelLimiter, Reservation};

/// Token counts reported by a user job for one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    /// Input tokens billed at the model's input rate.
    pub input_tokens: u64,
    /// Input tokens billed at the model's (cheaper) cached rate.
    pub cached_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
}

impl UsageReport {
    fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cached_tokens + self.output_tokens
    }
}

/// The result of one attempt against one model, costed at that model's pricing and
/// accumulated into the job's [`JobContext`], which tracks total cost across every
/// attempt.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    /// The model this attempt ran against.
    pub model_id: String,
    /// Input tokens billed at the input rate.
    pub input_tokens: u64,
    /// Input tokens billed at the cached rate.
    pub cached_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// `(input * P_in + cached * P_cached + output * P_out) / 10^6` at this model's
    /// configured pricing.
    pub cost: f64,
}

/// Everything a user job needs to know about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobRunContext {
    /// The job id this attempt belongs to.
    pub job_id: String,
    /// The model this attempt is running against.
    pub model_id: String,
    /// Models already tried (and abandoned) for this job before this attempt.
    pub tried_models: Vec<String>,
}

/// The outcome a user job reports back to the executor, in place of an
/// exception-as-control-flow delegation signal.
pub enum Outcome<D> {
    /// The job succeeded on this model; `data` is returned to the caller.
    Completed {
        /// The caller-facing result.
        data: D,
        /// Usage actually consumed by this attempt.
        usage: UsageReport,
    },
    /// The current model should be abandoned and the next one in the escalation order
    /// tried; usage already consumed on this model before giving up is still charged.
    Delegate {
        /// Usage consumed before delegating away from this model.
        usage: UsageReport,
    },
    /// The job failed outright; it will not be retried on another model.
    Rejected {
        /// Usage consumed before the failure.
        usage: UsageReport,
        /// A human-readable description of the failure.
        message: String,
    },
    /// The job panicked or raised an error the caller did not intend as a rejection
    /// signal; treated identically to `Rejected` with no usage to charge.
    Errored {
        /// A human-readable description of the failure.
        message: String,
    },
}

/// A unit of work dispatched by [`crate::Limiter::queue_job`].
///
/// Implemented for any `Fn(JobRunContext) -> impl Future<Output = Outcome<D>>` closure,
/// so callers rarely need to implement this by hand.
#[async_trait]
pub trait Job<D>: Send + Sync
where
    D: Send,
{
    /// Runs one attempt of the job against `ctx.model_id`.
    async fn run(&self, ctx: JobRunContext) -> Outcome<D>;
}

#[async_trait]
impl<F, Fut, D> Job<D> for F
where
    F: Fn(JobRunContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome<D>> + Send,
    D: Send,
{
    async fn run(&self, ctx: JobRunContext) -> Outcome<D> {
        self(ctx).await
    }
}

/// Per-job context accumulated across every attempt, returned to the caller on success
/// and carried in the `Err` arm on failure.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    /// The job id this context belongs to.
    pub job_id: String,
    /// Sum of `UsageEntry.cost` across every attempt.
    pub total_cost: f64,
    /// One entry per model attempted.
    pub usage: Vec<UsageEntry>,
}

/// The successful result of [`crate::Limiter::queue_job`].
#[derive(Debug, Clone)]
pub struct JobOutcome<D> {
    /// The caller-facing result from the attempt that completed the job.
    pub data: D,
    /// The model that ultimately completed the job.
    pub model_used: String,
    /// Usage and cost accumulated across every attempt.
    pub context: JobContext,
}

/// The delegation executor.
///
/// Owns no reservations itself — it is the sole caller of [`ModelLimiter::try_reserve`]
/// / [`ModelLimiter::release_reservation`] / [`ModelLimiter::commit`],
/// [`MemoryManager::acquire`] / [`MemoryManager::release`], and
/// [`CoordinationClient::acquire`] / [`CoordinationClient::release`], so a job's
/// reservations never outlive the task driving it.
pub struct DelegationExecutor {
    config: Arc<LimiterConfig>,
    model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
    job_types: Arc<JobTypeManager>,
    memory: Arc<MemoryManager>,
    coordination: Arc<CoordinationClient>,
    availability: Arc<AvailabilityTracker>,
    active: Mutex<HashMap<String, ActiveJobEntry>>,
}

struct ActiveJobEntry {
    job_type: String,
    current_model: Option<String>,
    tried_models: Vec<String>,
}

impl DelegationExecutor {
    /// Builds an executor over the given shared component handles.
    pub fn new(
        config: Arc<LimiterConfig>,
        model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
        job_types: Arc<JobTypeManager>,
        memory: Arc<MemoryManager>,
        coordination: Arc<CoordinationClient>,
        availability: Arc<AvailabilityTracker>,
    ) -> Self {
        Self {
            config,
            model_limiters,
            job_types,
            memory,
            coordination,
            availability,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// A snapshot of every job currently in flight on this executor, for `getActiveJobs`.
    pub async fn active_jobs(&self) -> Vec<crate::stats::ActiveJob> {
        self.active
            .lock()
            .await
            .iter()
            .map(|(job_id, entry)| crate::stats::ActiveJob {
                job_id: job_id.clone(),
                job_type: entry.job_type.clone(),
                current_model: entry.current_model.clone(),
                tried_models: entry.tried_models.clone(),
            })
            .collect()
    }

    fn limiter_for(&self, model_id: &str) -> &Arc<ModelLimiter> {
        self.model_limiters
            .get(model_id)
            .unwrap_or_else(|| abort_unknown_model(model_id))
    }

    fn estimate_for(&self, job_type: &str) -> Estimate {
        let job_type_config = &self.config.job_types[job_type];
        Estimate {
            tokens: job_type_config.estimated_tokens,
            requests: job_type_config.estimated_requests,
        }
    }

    /// `queueJob`: selects a job-type slot, then walks the escalation order, reserving
    /// local and remote capacity and invoking `job` until it completes, is rejected, or
    /// every model has been exhausted twice in a row.
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
        let job_id = job_id.into();
        if !self.job_types.is_known(job_type) {
            return Err(LimiterError::UnknownJobType {
                job_type: job_type.to_string(),
            });
        }

        let jt_token = self
            .job_types
            .acquire_slot(job_type, cancel)
            .await
            .ok_or_else(|| LimiterError::Cancelled { job_id: job_id.clone() })?;

        self.active.lock().await.insert(
            job_id.clone(),
            ActiveJobEntry {
                job_type: job_type.to_string(),
                current_model: None,
                tried_models: Vec::new(),
            },
        );

        let result = self.run_escalation_loop(&job_id, job_type, &job, cancel).await;

        self.active.lock().await.remove(&job_id);
        self.job_types.release(jt_token);
        result
    }

    /// `queueJobForModel`: dispatches directly to one model, bypassing job-type
    /// accounting entirely. This is raw model dispatch — no job-type slot is acquired or
    /// released, and there is no escalation or delegation: a `Delegate` outcome here is
    /// treated as a plain rejection.
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
        let job_id = job_id.into();
        let limiter = self.limiter_for(model_id);
        let now = Instant::now();

        let reservation = limiter
            .try_reserve(estimate, now)
            .await
            .ok_or_else(|| LimiterError::AllModelsExhausted { usage: Vec::new() })?;

        let acquired = self.coordination.acquire(model_id).await.unwrap_or(true);
        if !acquired {
            limiter.release_reservation(reservation, now).await;
            return Err(LimiterError::AllModelsExhausted { usage: Vec::new() });
        }

        let ctx = JobRunContext {
            job_id: job_id.clone(),
            model_id: model_id.to_string(),
            tried_models: Vec::new(),
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = self.coordination.release(model_id, 0, 0).await;
                limiter.release_reservation(reservation, now).await;
                return Err(LimiterError::Cancelled { job_id });
            }
            outcome = job.run(ctx) => outcome,
        };

        match outcome {
            Outcome::Completed { data, usage } => {
                let entry = self.settle(model_id, reservation, usage, limiter, now).await;
                Ok(JobOutcome {
                    data,
                    model_used: model_id.to_string(),
                    context: JobContext {
                        job_id,
                        total_cost: entry.cost,
                        usage: vec![entry],
                    },
                })
            }
            Outcome::Delegate { usage } => {
                let entry = self.settle(model_id, reservation, usage, limiter, now).await;
                Err(LimiterError::UserJobError {
                    job_id,
                    message: "queueJobForModel does not support delegation".to_string(),
                    usage: vec![entry],
                })
            }
            Outcome::Rejected { usage, message } => {
                let entry = self.settle(model_id, reservation, usage, limiter, now).await;
                Err(LimiterError::UserJobError {
                    job_id,
                    message,
                    usage: vec![entry],
                })
            }
            Outcome::Errored { message } => {
                limiter.release_reservation(reservation, now).await;
                let _ = self.coordination.release(model_id, 0, 0).await;
                Err(LimiterError::UserJobError {
                    job_id,
                    message,
                    usage: Vec::new(),
                })
            }
        }
    }

    async fn run_escalation_loop<D, J>(
        &self,
        job_id: &str,
        job_type: &str,
        job: &J,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome<D>, LimiterError>
    where
        D: Send,
        J: Job<D>,
    {
        let escalation_order = &self.config.escalation_order;
        let estimate = self.estimate_for(job_type);

        let mut tried_models: HashSet<String> = HashSet::new();
        let mut context = JobContext {
            job_id: job_id.to_string(),
            ..Default::default()
        };
        let mut exhausted_passes = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(LimiterError::Cancelled {
                    job_id: job_id.to_string(),
                });
            }

            let candidate = self
                .next_candidate(escalation_order, &tried_models, estimate)
                .await;

            let model_id = match candidate {
                Some(model_id) => model_id,
                None => {
                    if self.await_capacity_change(cancel).await.is_none() {
                        return Err(LimiterError::Cancelled {
                            job_id: job_id.to_string(),
                        });
                    }
                    if tried_models.len() >= escalation_order.len() {
                        exhausted_passes += 1;
                        tried_models.clear();
                        if exhausted_passes >= 2 {
                            return Err(LimiterError::AllModelsExhausted { usage: context.usage });
                        }
                    }
                    continue;
                }
            };
            tried_models.insert(model_id.clone());
            if let Some(entry) = self.active.lock().await.get_mut(job_id) {
                entry.current_model = Some(model_id.clone());
                entry.tried_models = tried_models.iter().cloned().collect();
            }

            match self
                .attempt(job_id, job_type, &model_id, estimate, job, &tried_models, cancel)
                .await
            {
                AttemptOutcome::Completed { data, entry } => {
                    context.total_cost += entry.cost;
                    context.usage.push(entry);
                    return Ok(JobOutcome {
                        data,
                        model_used: model_id,
                        context,
                    });
                }
                AttemptOutcome::Delegated { entry } => {
                    context.total_cost += entry.cost;
                    context.usage.push(entry);
                    // An explicit delegation signal carries no retry cap — the user job
                    // must eventually resolve or reject without delegating to terminate.
                    // Clearing `tried_models` here just lets every model be tried again.
                    if tried_models.len() == escalation_order.len() {
                        tried_models.clear();
                    }
                    continue;
                }
                AttemptOutcome::Rejected { entry, message } => {
                    context.total_cost += entry.cost;
                    context.usage.push(entry);
                    return Err(LimiterError::UserJobError {
                        job_id: job_id.to_string(),
                        message,
                        usage: context.usage,
                    });
                }
                AttemptOutcome::Errored { message } => {
                    return Err(LimiterError::UserJobError {
                        job_id: job_id.to_string(),
                        message,
                        usage: context.usage,
                    });
                }
                AttemptOutcome::Cancelled => {
                    return Err(LimiterError::Cancelled {
                        job_id: job_id.to_string(),
                    });
                }
                AttemptOutcome::LocalReservationFailed | AttemptOutcome::RemoteAcquireFailed => {
                    if tried_models.len() == escalation_order.len() {
                        exhausted_passes += 1;
                        tried_models.clear();
                        if exhausted_passes >= 2 {
                            return Err(LimiterError::AllModelsExhausted { usage: context.usage });
                        }
                    }
                    continue;
                }
            }
        }
    }

    /// The first model in escalation order, not yet tried this pass, that currently has
    /// local capacity. A cheap, racy check — the subsequent `try_reserve` is what
    /// actually decides.
    async fn next_candidate(
        &self,
        escalation_order: &[String],
        tried_models: &HashSet<String>,
        estimate: Estimate,
    ) -> Option<String> {
        let now = Instant::now();
        for model_id in escalation_order {
            if tried_models.contains(model_id) {
                continue;
            }
            let limiter = self.limiter_for(model_id);
            if limiter.has_capacity(estimate, now).await {
                return Some(model_id.clone());
            }
        }
        None
    }

    /// Waits for a capacity-change signal (availability event) or a poll interval,
    /// whichever comes first; honors cancellation. Returns `None` iff `cancel` fired.
    async fn await_capacity_change(&self, cancel: &CancellationToken) -> Option<()> {
        let mut events = self.availability.subscribe();
        let poll = self.job_types.tunables_wait_poll_interval();
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = drain_one(&mut events) => Some(()),
            _ = tokio::time::sleep(poll) => Some(()),
        }
    }

    /// One attempt against `model_id`: acquires memory, reserves local and remote
    /// capacity, invokes `job`, and settles the reservation against whatever outcome the
    /// job reports. The job invocation itself races the caller's cancellation token;
    /// on cancel, every reservation held at that point is released in the reverse of
    /// the order it was acquired.
    #[allow(clippy::too_many_arguments)]
    async fn attempt<D, J>(
        &self,
        job_id: &str,
        job_type: &str,
        model_id: &str,
        estimate: Estimate,
        job: &J,
        tried_models: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome<D>
    where
        D: Send,
        J: Job<D>,
    {
        let limiter = self.limiter_for(model_id);
        let now = Instant::now();

        let job_type_config = &self.config.job_types[job_type];
        let ratio = self.job_types.ratio(job_type);
        let memory_reservation = if job_type_config.estimated_memory_kb > 0 {
            match self
                .memory
                .acquire(job_type, job_type_config.estimated_memory_kb, ratio)
                .await
            {
                Some(reservation) => Some(reservation),
                None => return AttemptOutcome::LocalReservationFailed,
            }
        } else {
            None
        };

        let reservation = match limiter.try_reserve(estimate, now).await {
            Some(reservation) => reservation,
            None => {
                if let Some(memory_reservation) = memory_reservation {
                    self.memory.release(memory_reservation).await;
                }
                return AttemptOutcome::LocalReservationFailed;
            }
        };

        let acquired = self.coordination.acquire(model_id).await.unwrap_or_else(|err| {
            tracing::warn!(model_id, %err, "coordination acquire failed, proceeding on local reservation alone");
            true
        });
        if !acquired {
            if let Some(memory_reservation) = memory_reservation {
                self.memory.release(memory_reservation).await;
            }
            limiter.release_reservation(reservation, now).await;
            return AttemptOutcome::RemoteAcquireFailed;
        }

        let ctx = JobRunContext {
            job_id: job_id.to_string(),
            model_id: model_id.to_string(),
            tried_models: tried_models.iter().cloned().collect(),
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = self.coordination.release(model_id, 0, 0).await;
                limiter.release_reservation(reservation, now).await;
                if let Some(memory_reservation) = memory_reservation {
                    self.memory.release(memory_reservation).await;
                }
                return AttemptOutcome::Cancelled;
            }
            outcome = job.run(ctx) => outcome,
        };

        let result = match outcome {
            Outcome::Completed { data, usage } => {
                let entry = self.settle(model_id, reservation, usage, limiter, now).await;
                AttemptOutcome::Completed { data, entry }
            }
            Outcome::Delegate { usage } => {
                let entry = self.settle(model_id, reservation, usage, limiter, now).await;
                AttemptOutcome::Delegated { entry }
            }
            Outcome::Rejected { usage, message } => {
                let entry = self.settle(model_id, reservation, usage, limiter, now).await;
                AttemptOutcome::Rejected { entry, message }
            }
            Outcome::Errored { message } => {
                limiter.release_reservation(reservation, now).await;
                let _ = self.coordination.release(model_id, 0, 0).await;
                AttemptOutcome::Errored { message }
            }
        };

        if let Some(memory_reservation) = memory_reservation {
            self.memory.release(memory_reservation).await;
        }

        result
    }

    /// Commits `usage` to the local limiter and reports it to the coordination back
    /// end, returning the costed [`UsageEntry`] for this attempt.
    async fn settle(
        &self,
        model_id: &str,
        reservation: Reservation,
        usage: UsageReport,
        limiter: &Arc<ModelLimiter>,
        now: Instant,
    ) -> UsageEntry {
        let pricing = &self.config.models[model_id].pricing;
        let cost = pricing.cost(usage.input_tokens, usage.cached_tokens, usage.output_tokens);
        let actual_tokens = usage.total_tokens();
        limiter.commit(reservation, actual_tokens, 1, now).await;
        if let Err(err) = self.coordination.release(model_id, actual_tokens, 1).await {
            tracing::warn!(model_id, %err, "coordination release failed, local commit already applied");
        }
        UsageEntry {
            model_id: model_id.to_string(),
            input_tokens: usage.input_tokens,
            cached_tokens: usage.cached_tokens,
            output_tokens: usage.output_tokens,
            cost,
        }
    }
}

/// Awaits exactly one event from an availability broadcast receiver, ignoring lag.
async fn drain_one(events: &mut broadcast::Receiver<crate::availability::AvailabilityEvent>) {
    loop {
        match events.recv().await {
            Ok(_) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
            }
        }
    }
}

enum AttemptOutcome<D> {
    Completed { data: D, entry: UsageEntry },
    Delegated { entry: UsageEntry },
    Rejected { entry: UsageEntry, message: String },
    Errored { message: String },
    LocalReservationFailed,
    RemoteAcquireFailed,
    Cancelled,
}

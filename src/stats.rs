//! Aggregate snapshot types returned by `Limiter::get*`.
//!
//! Nothing here holds state of its own — every type is assembled on demand from the
//! owning components' existing snapshot methods.

use crate::coordination::InstanceInfo;
use crate::job_type::JobTypeSnapshot;
use crate::model_limiter::ModelSnapshot;

/// A point-in-time view of one in-flight job, for `getActiveJobs`.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    /// The job id.
    pub job_id: String,
    /// The job type this job was submitted under.
    pub job_type: String,
    /// The model currently being attempted, if any attempt is in flight.
    pub current_model: Option<String>,
    /// Models already tried and abandoned for this job.
    pub tried_models: Vec<String>,
}

/// The cross-component snapshot returned by `getStats`.
#[derive(Debug, Clone)]
pub struct Stats {
    /// Per-model rate-limiter state.
    pub models: Vec<ModelSnapshot>,
    /// Per-job-type pool state.
    pub job_types: Vec<JobTypeSnapshot>,
    /// Every instance the coordination back end currently has registered.
    pub instances: Vec<InstanceInfo>,
    /// Jobs currently in flight on this instance.
    pub active_jobs: Vec<ActiveJob>,
    /// Total memory currently reserved across all job types, in KB.
    pub memory_used_kb: u64,
    /// The configured process-wide memory budget, in KB.
    pub memory_budget_kb: u64,
}

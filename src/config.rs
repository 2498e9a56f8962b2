//! Static configuration: models, job types, escalation order, and the tunables that
//! govern background loops and the coordination client.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dollars per 10^6 tokens, split by token class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per 10^6 input tokens.
    pub input: f64,
    /// Price per 10^6 cached-input tokens.
    pub cached: f64,
    /// Price per 10^6 output tokens.
    pub output: f64,
}

impl Pricing {
    /// Cost, in dollars, of the given token counts at this pricing.
    pub fn cost(&self, input: u64, cached: u64, output: u64) -> f64 {
        let per_million = 1_000_000.0;
        (input as f64 * self.input + cached as f64 * self.cached + output as f64 * self.output)
            / per_million
    }
}

/// Static configuration for one back-end model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Unique model identifier, used throughout the escalation order and stats.
    pub id: String,
    /// Requests-per-minute quota, if this model limits on it.
    pub requests_per_minute: Option<u64>,
    /// Requests-per-day quota, if this model limits on it.
    pub requests_per_day: Option<u64>,
    /// Tokens-per-minute quota, if this model limits on it.
    pub tokens_per_minute: Option<u64>,
    /// Tokens-per-day quota, if this model limits on it.
    pub tokens_per_day: Option<u64>,
    /// Maximum number of requests that may be in flight on this model at once.
    pub max_concurrent: Option<u64>,
    /// Pricing used to cost completed attempts against this model.
    pub pricing: Pricing,
}

impl ModelConfig {
    /// Validates that at least one rate dimension is configured.
    ///
    /// # Panics
    /// Panics if no dimension (RPM/RPD/TPM/TPD/concurrency) is configured — this is a
    /// configuration-time programming error, not a runtime condition.
    pub fn validate(&self) {
        assert!(
            self.requests_per_minute.is_some()
                || self.requests_per_day.is_some()
                || self.tokens_per_minute.is_some()
                || self.tokens_per_day.is_some()
                || self.max_concurrent.is_some(),
            "model '{}' has no rate dimension configured",
            self.id
        );
    }
}

/// Static configuration for one job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTypeConfig {
    /// Unique job-type identifier.
    pub id: String,
    /// Estimated tokens consumed by one job of this type, used for every model tried.
    pub estimated_tokens: u64,
    /// Estimated requests consumed by one job of this type (almost always 1).
    pub estimated_requests: u64,
    /// Estimated host memory, in KB, held while one job of this type runs.
    pub estimated_memory_kb: u64,
    /// Initial share of local capacity allotted to this job type.
    pub initial_ratio: f64,
    /// Whether the ratio-adjustment loop may move this job type's ratio.
    pub flexible: bool,
    /// Lower bound on the slot count this job type may be clamped to.
    pub min_capacity: Option<u64>,
    /// Upper bound on the slot count this job type may be clamped to.
    pub max_capacity: Option<u64>,
}

impl JobTypeConfig {
    fn validate(&self) {
        assert!(self.estimated_tokens >= 1, "estimated_tokens must be >= 1");
        assert!(
            self.estimated_requests >= 1,
            "estimated_requests must be >= 1"
        );
        assert!(
            self.initial_ratio > 0.0 && self.initial_ratio <= 1.0,
            "job type '{}' ratio must be in (0, 1]",
            self.id
        );
    }
}

/// Tunables for the ratio-adjustment loop and the distributed coordination client,
/// grouped so `LimiterConfig` stays flat elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    /// Tick interval for sampling flexible job-type demand.
    pub ratio_adjustment_tick: Duration,
    /// Exponential smoothing factor applied to flexible ratios, `α ∈ (0, 1]`.
    pub smoothing_factor: f64,
    /// Poll interval used by cooperative wait loops (job-type slots, capacity changes).
    pub wait_poll_interval: Duration,
    /// Heartbeat interval sent to the coordination back-end.
    pub heartbeat_interval: Duration,
    /// Age after which a missed-heartbeat instance is considered stale and evicted.
    pub stale_instance_timeout: Duration,
    /// Fallback pool size used by RECOMPUTE when a model has no configured dimension.
    pub default_pool_size: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ratio_adjustment_tick: Duration::from_millis(250),
            smoothing_factor: 0.2,
            wait_poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            stale_instance_timeout: Duration::from_secs(15),
            default_pool_size: 100,
        }
    }
}

/// Full static configuration for a [`crate::Limiter`].
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Every model the limiter may dispatch to, keyed by id.
    pub models: HashMap<String, ModelConfig>,
    /// Every job type the limiter accepts, keyed by id.
    pub job_types: HashMap<String, JobTypeConfig>,
    /// The ordered list of model ids tried for each job, before `AllModelsExhausted`.
    pub escalation_order: Vec<String>,
    /// Process-wide memory budget, in KB, partitioned across job types.
    pub memory_budget_kb: u64,
    /// Tunable intervals and coefficients.
    pub tunables: Tunables,
    /// A key prefix scoping this deployment's coordination state.
    pub coordination_prefix: String,
}

impl LimiterConfig {
    /// Validates the configuration and normalizes job-type ratios to sum to 1.
    ///
    /// Ratios across job types should sum to 1; this normalizes them unconditionally,
    /// regardless of whether the input already summed to 1.
    ///
    /// # Panics
    /// Panics on a structurally invalid configuration (empty escalation order, an
    /// escalation entry with no matching model, a model configured with no rate
    /// dimension). These are configuration-time programming errors.
    pub fn validate_and_normalize(&mut self) {
        assert!(
            !self.escalation_order.is_empty(),
            "escalation order must not be empty"
        );
        for model_id in &self.escalation_order {
            assert!(
                self.models.contains_key(model_id),
                "escalation order references unknown model '{model_id}'"
            );
        }
        for model in self.models.values() {
            model.validate();
        }
        for job_type in self.job_types.values() {
            job_type.validate();
        }

        let total: f64 = self.job_types.values().map(|j| j.initial_ratio).sum();
        if total > 0.0 && (total - 1.0).abs() > f64::EPSILON {
            tracing::debug!(total, "normalizing job-type ratios to sum to 1");
            for job_type in self.job_types.values_mut() {
                job_type.initial_ratio /= total;
            }
        }
    }

    /// The arithmetic mean of `estimated_tokens` across all configured job types.
    ///
    /// Used by RECOMPUTE to turn a token budget into a slot count. Clamped to at least
    /// 1 so an empty job-type table never produces a division by zero.
    pub fn avg_estimated_tokens(&self) -> f64 {
        if self.job_types.is_empty() {
            return 1.0;
        }
        let sum: u64 = self.job_types.values().map(|j| j.estimated_tokens).sum();
        sum as f64 / self.job_types.len() as f64
    }

    /// The arithmetic mean of `estimated_requests` across all configured job types.
    pub fn avg_estimated_requests(&self) -> f64 {
        if self.job_types.is_empty() {
            return 1.0;
        }
        let sum: u64 = self.job_types.values().map(|j| j.estimated_requests).sum();
        sum as f64 / self.job_types.len() as f64
    }
}

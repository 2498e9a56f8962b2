//! The distributed coordination protocol.
//!
//! [`Coordinator`] is the narrow, storage-agnostic interface any back-end can
//! implement: five atomic operations plus a subscription stream and a maintenance
//! sweep. [`memory`] is the in-process reference realization (also what tests run
//! against); [`redis`] is the Redis+Lua realization, gated behind the `redis-backend`
//! feature.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

mod client;

pub use client::CoordinationClient;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::LimiterError;

/// This instance's slot pool for one model, as computed by RECOMPUTE.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModelPool {
    /// Integer concurrency-equivalent slot budget for this instance on this model.
    pub total_slots: u64,
    /// This instance's share of the model's tokens-per-minute budget.
    pub tokens_per_minute: Option<u64>,
    /// This instance's share of the model's requests-per-minute budget.
    pub requests_per_minute: Option<u64>,
    /// This instance's share of the model's tokens-per-day budget.
    pub tokens_per_day: Option<u64>,
    /// This instance's share of the model's requests-per-day budget.
    pub requests_per_day: Option<u64>,
}

/// A full allocation push: this instance's pools for every model, plus the instance
/// count RECOMPUTE used to derive them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Allocation {
    /// Number of live instances RECOMPUTE observed when producing this allocation.
    pub instance_count: u64,
    /// Monotonically increasing per-coordinator counter, bumped once per RECOMPUTE.
    /// Unlike `instance_count`, this never moves backward, so it's what a client uses
    /// to detect an out-of-order push — `instance_count` legitimately decreases
    /// whenever an instance leaves.
    pub sequence: u64,
    /// Per-model pools for this instance.
    pub pools: HashMap<String, ModelPool>,
}

/// A point-in-time view of one registered instance, for stats/debugging.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    /// The instance id.
    pub instance_id: String,
    /// Milliseconds since the instance's last heartbeat, at observation time.
    pub ms_since_heartbeat: u64,
    /// In-flight count per model, as tracked centrally by ACQUIRE/RELEASE.
    pub in_flight_by_model: HashMap<String, u64>,
}

/// The storage-agnostic coordination protocol.
///
/// Every method is specified to execute as a single serialized step against the
/// backing store — the reference [`memory`] implementation serializes with a mutex;
/// [`redis`] serializes with Lua scripts.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// REGISTER: adds `instance_id`, triggers RECOMPUTE, returns its new allocation.
    async fn register(&self, instance_id: &str) -> Result<Allocation, LimiterError>;

    /// UNREGISTER: removes `instance_id` and its allocation, triggers RECOMPUTE.
    async fn unregister(&self, instance_id: &str) -> Result<(), LimiterError>;

    /// ACQUIRE: claims one slot of `model_id`'s pool for `instance_id`, iff one is
    /// free. Returns `false` (changing nothing) if the pool is exhausted.
    async fn acquire(&self, instance_id: &str, model_id: &str) -> Result<bool, LimiterError>;

    /// RELEASE: returns the slot, records actual usage against the shared window
    /// counters, and triggers RECOMPUTE.
    async fn release(
        &self,
        instance_id: &str,
        model_id: &str,
        actual_tokens: u64,
        actual_requests: u64,
    ) -> Result<(), LimiterError>;

    /// HEARTBEAT: refreshes `instance_id`'s liveness timestamp.
    async fn heartbeat(&self, instance_id: &str) -> Result<(), LimiterError>;

    /// The maintenance sweep: evicts instances whose heartbeat is older than `max_age`
    /// and triggers RECOMPUTE if any were evicted.
    async fn cleanup(&self, max_age: Duration) -> Result<(), LimiterError>;

    /// Subscribes to allocation pushes for `instance_id`.
    fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<Allocation>;

    /// A snapshot of every currently registered instance, for `getStats`/debugging.
    async fn instances(&self) -> Vec<InstanceInfo>;
}

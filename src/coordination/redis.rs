//! Redis-backed [`Coordinator`], gated behind the `redis-backend` feature.
//!
//! The five atomic primitives (REGISTER/UNREGISTER/ACQUIRE/RELEASE/HEARTBEAT) are Lua
//! scripts: `Script::new(...)`, bind keys/args, `invoke_async`. RECOMPUTE is plain Rust
//! over a `ConnectionManager` — it reads several hashes, is not required to race with
//! itself (the maintenance ops that trigger it already run one at a time on this
//! instance), and a Lua re-implementation of its floor/min arithmetic would buy
//! atomicity this protocol doesn't actually need: two processes recomputing from
//! slightly different reads converge to the same allocation on the next timer tick
//! regardless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{LimiterConfig, ModelConfig};
use crate::error::LimiterError;

use super::{Allocation, Coordinator, InstanceInfo, ModelPool};

const MINUTE_TTL_SECS: u64 = 120;
const DAY_TTL_SECS: u64 = 25 * 3600;

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// On-wire form of [`Allocation`] — the struct itself has no `Serialize`/`Deserialize`
/// because [`super::memory`] never needs one.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireAllocation {
    instance_count: u64,
    sequence: u64,
    pools: HashMap<String, WirePool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WirePool {
    total_slots: u64,
    tokens_per_minute: Option<u64>,
    requests_per_minute: Option<u64>,
    tokens_per_day: Option<u64>,
    requests_per_day: Option<u64>,
}

impl From<Allocation> for WireAllocation {
    fn from(a: Allocation) -> Self {
        WireAllocation {
            instance_count: a.instance_count,
            sequence: a.sequence,
            pools: a
                .pools
                .into_iter()
                .map(|(k, p)| {
                    (
                        k,
                        WirePool {
                            total_slots: p.total_slots,
                            tokens_per_minute: p.tokens_per_minute,
                            requests_per_minute: p.requests_per_minute,
                            tokens_per_day: p.tokens_per_day,
                            requests_per_day: p.requests_per_day,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl From<WireAllocation> for Allocation {
    fn from(w: WireAllocation) -> Self {
        Allocation {
            instance_count: w.instance_count,
            sequence: w.sequence,
            pools: w
                .pools
                .into_iter()
                .map(|(k, p)| {
                    (
                        k,
                        ModelPool {
                            total_slots: p.total_slots,
                            tokens_per_minute: p.tokens_per_minute,
                            requests_per_minute: p.requests_per_minute,
                            tokens_per_day: p.tokens_per_day,
                            requests_per_day: p.requests_per_day,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AllocUpdateMessage {
    instance_id: String,
    allocation: WireAllocation,
}

/// The Redis+Lua realization of the coordination protocol.
pub struct RedisCoordinator {
    manager: ConnectionManager,
    client: Client,
    prefix: String,
    model_configs: HashMap<String, ModelConfig>,
    avg_estimated_tokens: f64,
    avg_estimated_requests: f64,
    default_pool_size: u64,
    register_script: Script,
    unregister_script: Script,
    acquire_script: Script,
    release_script: Script,
    heartbeat_script: Script,
    senders: Arc<StdMutex<HashMap<String, broadcast::Sender<Allocation>>>>,
}

impl RedisCoordinator {
    /// Connects to `redis_url` and builds a coordinator scoped under
    /// `config.coordination_prefix`. Spawns the pub-sub fan-out listener immediately.
    pub async fn connect(redis_url: &str, config: &LimiterConfig) -> Result<Self, LimiterError> {
        let client = Client::open(redis_url).map_err(|e| LimiterError::CoordinationUnavailable {
            reason: e.to_string(),
        })?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable {
                reason: e.to_string(),
            })?;

        let senders: Arc<StdMutex<HashMap<String, broadcast::Sender<Allocation>>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let coordinator = Self {
            manager,
            client,
            prefix: config.coordination_prefix.clone(),
            model_configs: config.models.clone(),
            avg_estimated_tokens: config.avg_estimated_tokens(),
            avg_estimated_requests: config.avg_estimated_requests(),
            default_pool_size: config.tunables.default_pool_size,
            register_script: Script::new(
                r#"
                redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                return redis.call('HLEN', KEYS[1])
                "#,
            ),
            unregister_script: Script::new(
                r#"
                redis.call('HDEL', KEYS[1], ARGV[1])
                redis.call('HDEL', KEYS[2], ARGV[1])
                redis.call('DEL', KEYS[3])
                return redis.call('HLEN', KEYS[1])
                "#,
            ),
            acquire_script: Script::new(
                r#"
                local raw = redis.call('HGET', KEYS[1], ARGV[1])
                if not raw then return 0 end
                local alloc = cjson.decode(raw)
                local pool = alloc.pools[ARGV[2]]
                if not pool or pool.total_slots <= 0 then return 0 end
                pool.total_slots = pool.total_slots - 1
                redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(alloc))
                redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
                return 1
                "#,
            ),
            release_script: Script::new(
                r#"
                local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
                if current > 0 then
                    redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
                end
                redis.call('HINCRBY', KEYS[2], 'sum', ARGV[2])
                redis.call('EXPIRE', KEYS[2], ARGV[4])
                redis.call('HINCRBY', KEYS[3], 'sum', ARGV[3])
                redis.call('EXPIRE', KEYS[3], ARGV[4])
                redis.call('HINCRBY', KEYS[4], 'sum', ARGV[2])
                redis.call('EXPIRE', KEYS[4], ARGV[5])
                redis.call('HINCRBY', KEYS[5], 'sum', ARGV[3])
                redis.call('EXPIRE', KEYS[5], ARGV[5])
                return 1
                "#,
            ),
            heartbeat_script: Script::new(
                r#"
                redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
                return 1
                "#,
            ),
            senders,
        };

        coordinator.spawn_pubsub_listener();
        Ok(coordinator)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn inflight_key(&self, instance_id: &str) -> String {
        self.key(&format!("inflight:{instance_id}"))
    }

    fn usage_key(&self, model_id: &str, dim: &str, window_start_ms: u64) -> String {
        self.key(&format!("usage:{model_id}:{dim}:{window_start_ms}"))
    }

    fn channel(&self) -> String {
        self.key("alloc-updates")
    }

    fn sequence_key(&self) -> String {
        self.key("recompute-seq")
    }

    /// Spawns the loop that turns Redis pub-sub messages on the shared allocation
    /// channel into local broadcast sends, retrying the subscription on disconnect.
    fn spawn_pubsub_listener(&self) {
        let client = self.client.clone();
        let channel = self.channel();
        let senders = Arc::clone(&self.senders);

        tokio::spawn(async move {
            loop {
                match Self::run_pubsub_listener(&client, &channel, &senders).await {
                    Ok(()) => break,
                    Err(err) => {
                        tracing::warn!(%err, "redis allocation listener error, retrying in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    async fn run_pubsub_listener(
        client: &Client,
        channel: &str,
        senders: &StdMutex<HashMap<String, broadcast::Sender<Allocation>>>,
    ) -> Result<(), redis::RedisError> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let mut stream = pubsub.on_message();

        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(%err, "malformed allocation-update payload");
                    continue;
                }
            };
            let Ok(parsed) = serde_json::from_str::<AllocUpdateMessage>(&payload) else {
                tracing::warn!("could not decode allocation-update message");
                continue;
            };

            let sender = {
                let guard = senders.lock().expect("senders mutex poisoned");
                guard.get(&parsed.instance_id).cloned()
            };
            if let Some(sender) = sender {
                let _ = sender.send(parsed.allocation.into());
            }
        }
        Ok(())
    }

    async fn recompute(&self) -> Result<(), LimiterError> {
        let mut conn = self.manager.clone();
        let instances_key = self.key("instances");
        let allocations_key = self.key("allocations");

        let instances: HashMap<String, u64> = conn
            .hgetall(&instances_key)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
        let n = (instances.len() as u64).max(1);

        let sequence: u64 = conn
            .incr(&self.sequence_key(), 1)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;

        let now_ms = now_unix_ms();
        let minute_window_start = (now_ms / 60_000) * 60_000;
        let day_window_start = (now_ms / 86_400_000) * 86_400_000;

        let mut pools = HashMap::with_capacity(self.model_configs.len());
        for (model_id, cfg) in &self.model_configs {
            let tpm_used = if cfg.tokens_per_minute.is_some() {
                Some(self.read_usage_sum(model_id, "tpm", minute_window_start).await?)
            } else {
                None
            };
            let rpm_used = if cfg.requests_per_minute.is_some() {
                Some(self.read_usage_sum(model_id, "rpm", minute_window_start).await?)
            } else {
                None
            };
            let tpd_used = if cfg.tokens_per_day.is_some() {
                Some(self.read_usage_sum(model_id, "tpd", day_window_start).await?)
            } else {
                None
            };
            let rpd_used = if cfg.requests_per_day.is_some() {
                Some(self.read_usage_sum(model_id, "rpd", day_window_start).await?)
            } else {
                None
            };

            let per_instance_tpm = cfg
                .tokens_per_minute
                .zip(tpm_used)
                .map(|(limit, used)| limit.saturating_sub(used) / n);
            let per_instance_rpm = cfg
                .requests_per_minute
                .zip(rpm_used)
                .map(|(limit, used)| limit.saturating_sub(used) / n);
            let per_instance_tpd = cfg
                .tokens_per_day
                .zip(tpd_used)
                .map(|(limit, used)| limit.saturating_sub(used) / n);
            let per_instance_rpd = cfg
                .requests_per_day
                .zip(rpd_used)
                .map(|(limit, used)| limit.saturating_sub(used) / n);

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

        let allocation = Allocation { instance_count: n, sequence, pools };
        let wire: WireAllocation = allocation.clone().into();
        let payload = serde_json::to_string(&wire).map_err(|e| LimiterError::CoordinationUnavailable {
            reason: e.to_string(),
        })?;

        let mut conn = self.manager.clone();
        for instance_id in instances.keys() {
            let _: () = conn
                .hset(&allocations_key, instance_id, &payload)
                .await
                .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;

            let message = serde_json::to_string(&AllocUpdateMessage {
                instance_id: instance_id.clone(),
                allocation: wire.clone(),
            })
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
            let _: i64 = conn
                .publish(self.channel(), message)
                .await
                .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
        }

        Ok(())
    }

    async fn read_usage_sum(&self, model_id: &str, dim: &str, window_start: u64) -> Result<u64, LimiterError> {
        let mut conn = self.manager.clone();
        let key = self.usage_key(model_id, dim, window_start);
        let sum: Option<u64> = conn
            .hget(&key, "sum")
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
        Ok(sum.unwrap_or(0))
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
impl Coordinator for RedisCoordinator {
    async fn register(&self, instance_id: &str) -> Result<Allocation, LimiterError> {
        let mut conn = self.manager.clone();
        let _: u64 = self
            .register_script
            .key(self.key("instances"))
            .arg(instance_id)
            .arg(now_unix_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;

        self.get_or_create_sender(instance_id);
        self.recompute().await?;

        let raw: Option<String> = conn
            .hget(self.key("allocations"), instance_id)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
        let wire: WireAllocation = raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(WireAllocation { instance_count: 1, sequence: 0, pools: HashMap::new() });
        Ok(wire.into())
    }

    async fn unregister(&self, instance_id: &str) -> Result<(), LimiterError> {
        let mut conn = self.manager.clone();
        let _: u64 = self
            .unregister_script
            .key(self.key("instances"))
            .key(self.key("allocations"))
            .key(self.inflight_key(instance_id))
            .arg(instance_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;

        self.senders.lock().expect("senders mutex poisoned").remove(instance_id);
        self.recompute().await
    }

    async fn acquire(&self, instance_id: &str, model_id: &str) -> Result<bool, LimiterError> {
        let mut conn = self.manager.clone();
        let granted: i64 = self
            .acquire_script
            .key(self.key("allocations"))
            .key(self.inflight_key(instance_id))
            .arg(instance_id)
            .arg(model_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;

        if granted == 1 {
            let _: u64 = self
                .heartbeat_script
                .key(self.key("instances"))
                .arg(instance_id)
                .arg(now_unix_ms())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
        }
        Ok(granted == 1)
    }

    async fn release(
        &self,
        instance_id: &str,
        model_id: &str,
        actual_tokens: u64,
        actual_requests: u64,
    ) -> Result<(), LimiterError> {
        let now_ms = now_unix_ms();
        let minute_window_start = (now_ms / 60_000) * 60_000;
        let day_window_start = (now_ms / 86_400_000) * 86_400_000;

        let mut conn = self.manager.clone();
        let _: i64 = self
            .release_script
            .key(self.inflight_key(instance_id))
            .key(self.usage_key(model_id, "tpm", minute_window_start))
            .key(self.usage_key(model_id, "rpm", minute_window_start))
            .key(self.usage_key(model_id, "tpd", day_window_start))
            .key(self.usage_key(model_id, "rpd", day_window_start))
            .arg(model_id)
            .arg(actual_tokens)
            .arg(actual_requests)
            .arg(MINUTE_TTL_SECS)
            .arg(DAY_TTL_SECS)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;

        self.recompute().await
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<(), LimiterError> {
        let mut conn = self.manager.clone();
        let _: u64 = self
            .heartbeat_script
            .key(self.key("instances"))
            .arg(instance_id)
            .arg(now_unix_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
        Ok(())
    }

    async fn cleanup(&self, max_age: Duration) -> Result<(), LimiterError> {
        let mut conn = self.manager.clone();
        let instances: HashMap<String, u64> = conn
            .hgetall(self.key("instances"))
            .await
            .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;

        let now_ms = now_unix_ms();
        let stale: Vec<String> = instances
            .into_iter()
            .filter(|(_, heartbeat)| now_ms.saturating_sub(*heartbeat) > max_age.as_millis() as u64)
            .map(|(id, _)| id)
            .collect();

        if stale.is_empty() {
            return Ok(());
        }

        for id in &stale {
            tracing::warn!(instance_id = id.as_str(), "evicting stale instance");
            let _: () = conn
                .hdel(self.key("instances"), id)
                .await
                .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
            let _: () = conn
                .hdel(self.key("allocations"), id)
                .await
                .map_err(|e| LimiterError::CoordinationUnavailable { reason: e.to_string() })?;
            self.senders.lock().expect("senders mutex poisoned").remove(id);
        }

        self.recompute().await
    }

    fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<Allocation> {
        self.get_or_create_sender(instance_id).subscribe()
    }

    async fn instances(&self) -> Vec<InstanceInfo> {
        let mut conn = self.manager.clone();
        let instances: HashMap<String, u64> = conn.hgetall(self.key("instances")).await.unwrap_or_default();
        let now_ms = now_unix_ms();

        instances
            .into_iter()
            .map(|(id, heartbeat)| InstanceInfo {
                instance_id: id,
                ms_since_heartbeat: now_ms.saturating_sub(heartbeat),
                in_flight_by_model: HashMap::new(),
            })
            .collect()
    }
}

//! End-to-end scenarios against the top-level facade, running against
//! [`InMemoryCoordinator`] as a single instance unless a scenario specifically exercises
//! multi-instance behavior.

use std::sync::Arc;
use std::time::Duration;

use quota_relay::config::{JobTypeConfig, ModelConfig, Pricing, Tunables};
use quota_relay::coordination::memory::InMemoryCoordinator;
use quota_relay::{JobRunContext, Limiter, LimiterConfig, Outcome};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn model(id: &str, rpm: Option<u64>, tpm: Option<u64>) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        requests_per_minute: rpm,
        requests_per_day: None,
        tokens_per_minute: tpm,
        tokens_per_day: None,
        max_concurrent: None,
        pricing: Pricing {
            input: 1.0,
            cached: 0.5,
            output: 2.0,
        },
    }
}

fn job_type(id: &str, estimated_tokens: u64, ratio: f64, flexible: bool) -> JobTypeConfig {
    JobTypeConfig {
        id: id.to_string(),
        estimated_tokens,
        estimated_requests: 1,
        estimated_memory_kb: 0,
        initial_ratio: ratio,
        flexible,
        min_capacity: None,
        max_capacity: None,
    }
}

fn config(models: Vec<ModelConfig>, job_types: Vec<JobTypeConfig>, escalation_order: Vec<&str>) -> LimiterConfig {
    LimiterConfig {
        models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        job_types: job_types.into_iter().map(|j| (j.id.clone(), j)).collect(),
        escalation_order: escalation_order.into_iter().map(String::from).collect(),
        memory_budget_kb: 1_000_000,
        tunables: Tunables {
            wait_poll_interval: Duration::from_millis(10),
            ratio_adjustment_tick: Duration::from_millis(20),
            heartbeat_interval: Duration::from_secs(5),
            ..Tunables::default()
        },
        coordination_prefix: "scenario:".into(),
    }
}

async fn new_limiter(config: LimiterConfig, instance_id: &str) -> Limiter {
    let coordinator: Arc<dyn quota_relay::Coordinator> = Arc::new(InMemoryCoordinator::new(&config));
    let limiter = Limiter::new(config, coordinator, instance_id);
    limiter.start().await.expect("start must succeed against an in-memory coordinator");
    limiter
}

async fn resolves_immediately(ctx: JobRunContext) -> Outcome<()> {
    let _ = ctx;
    Outcome::Completed {
        data: (),
        usage: Default::default(),
    }
}

/// E1: two models at `requestsPerMinute=5` each; the first 10 of 12 jobs split 5/5
/// across them, the 11th finds both windows exhausted and must wait.
#[tokio::test(start_paused = true)]
async fn escalates_across_models_when_rpm_exhausted() {
    let cfg = config(
        vec![model("mA", Some(5), None), model("mB", Some(5), None)],
        vec![job_type("chat", 1, 1.0, false)],
        vec!["mA", "mB"],
    );
    let limiter = new_limiter(cfg, "i1").await;
    let cancel = CancellationToken::new();

    for i in 0..10 {
        limiter
            .queue_job(format!("job-{i}"), "chat", resolves_immediately, &cancel)
            .await
            .unwrap_or_else(|err| panic!("job {i} should have capacity on mA or mB: {err}"));
    }

    assert!(
        !limiter.has_capacity_for_model("mA").await,
        "mA's RPM window should be fully committed"
    );
    assert!(
        !limiter.has_capacity_for_model("mB").await,
        "mB's RPM window should be fully committed"
    );

    let waiting_cancel = cancel.clone();
    let waiting = tokio::spawn(async move {
        let limiter_waiting = limiter;
        let result = limiter_waiting
            .queue_job("job-10", "chat", resolves_immediately, &waiting_cancel)
            .await;
        (limiter_waiting, result)
    });

    // Neither window has capacity yet; the job must still be waiting a moment later.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished(), "11th job must wait for a window to roll, not fail immediately");

    tokio::time::advance(Duration::from_secs(61)).await;
    let (limiter, result) = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("job should complete once the window rolls")
        .unwrap();
    assert!(result.is_ok(), "job should succeed once either window resets");
    limiter.stop().await.unwrap();
}

/// E2: actual usage can exceed the estimate; the committed amount, not the estimate,
/// is what's charged against the window.
#[tokio::test]
async fn actual_usage_overrides_the_reservation_estimate() {
    let cfg = config(
        vec![model("m1", None, Some(1000))],
        vec![job_type("chat", 100, 1.0, false)],
        vec!["m1"],
    );
    let limiter = new_limiter(cfg, "i1").await;
    let cancel = CancellationToken::new();

    let job = |ctx: JobRunContext| async move {
        let _ = ctx;
        Outcome::Completed {
            data: (),
            usage: quota_relay::UsageReport {
                input_tokens: 1100,
                cached_tokens: 0,
                output_tokens: 0,
            },
        }
    };
    limiter.queue_job("job-1", "chat", job, &cancel).await.unwrap();

    let snapshot = limiter.get_model_stats("m1").await.unwrap();
    let tpm = snapshot.tpm.unwrap();
    assert_eq!(tpm.committed, 1100, "actual usage, not the 100-token estimate, is committed");
    assert!(
        !limiter.has_capacity_for_model("m1").await,
        "the 1000-token budget is fully spent by the 1100-token actual usage"
    );

    limiter.stop().await.unwrap();
}

/// E3: `mA` always delegates, `mB` always completes; the job's context accumulates
/// usage from both attempts and reports the model that actually finished the job.
#[tokio::test]
async fn delegation_accumulates_usage_across_models() {
    let cfg = config(
        vec![model("mA", None, Some(100_000)), model("mB", None, Some(100_000))],
        vec![job_type("chat", 10, 1.0, false)],
        vec!["mA", "mB"],
    );
    let limiter = new_limiter(cfg, "i1").await;
    let cancel = CancellationToken::new();

    let job = |ctx: JobRunContext| async move {
        if ctx.model_id == "mA" {
            Outcome::Delegate {
                usage: quota_relay::UsageReport {
                    input_tokens: 10,
                    cached_tokens: 0,
                    output_tokens: 0,
                },
            }
        } else {
            Outcome::Completed {
                data: "done",
                usage: quota_relay::UsageReport {
                    input_tokens: 20,
                    cached_tokens: 0,
                    output_tokens: 5,
                },
            }
        }
    };

    let outcome = limiter.queue_job("job-1", "chat", job, &cancel).await.unwrap();
    assert_eq!(outcome.model_used, "mB");
    assert_eq!(outcome.context.usage.len(), 2, "one usage entry per attempted model");

    let pricing_a = Pricing { input: 1.0, cached: 0.5, output: 2.0 };
    let expected_cost = pricing_a.cost(10, 0, 0) + pricing_a.cost(20, 0, 5);
    assert!(
        (outcome.context.total_cost - expected_cost).abs() < 1e-9,
        "total cost must be the sum of per-model costs at each model's own pricing"
    );

    limiter.stop().await.unwrap();
}

/// E5: a flexible job type saturated with demand sees its effective ratio grow over
/// successive adjustment ticks, while a fixed job type's ratio never moves.
#[tokio::test]
async fn flexible_ratio_grows_under_saturated_demand() {
    let cfg = config(
        vec![model("m1", None, Some(1_000_000))],
        vec![
            job_type("fixedJobType", 1, 0.4, false),
            job_type("flexJob", 1, 0.6, true),
        ],
        vec!["m1"],
    );
    let limiter = Arc::new(new_limiter(cfg, "i1").await);
    let cancel = CancellationToken::new();

    // Hold every flexJob slot open concurrently so demand stays saturated across ticks.
    // Each held job blocks on its own copy of `cancel` and resolves once it fires,
    // so cleanup below can join every task instead of leaking them.
    let mut held = Vec::new();
    loop {
        if !limiter.has_capacity_for_job_type("flexJob") {
            break;
        }
        let wait_cancel = cancel.clone();
        let job_cancel = cancel.clone();
        let limiter = Arc::clone(&limiter);
        held.push(tokio::spawn(async move {
            let job = move |_ctx: JobRunContext| {
                let job_cancel = job_cancel.clone();
                async move {
                    job_cancel.cancelled().await;
                    Outcome::Rejected {
                        usage: quota_relay::UsageReport::default(),
                        message: "scenario cleanup".to_string(),
                    }
                }
            };
            let job_id = format!("held-{}", Uuid::new_v4());
            let _ = limiter.queue_job::<(), _>(job_id, "flexJob", job, &wait_cancel).await;
        }));
        if held.len() > 64 {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot_before = limiter.get_job_type_stats();
    let fixed_before = snapshot_before.iter().find(|s| s.job_type == "fixedJobType").unwrap().ratio;
    assert_eq!(fixed_before, 0.4, "a non-flexible ratio never moves");

    cancel.cancel();
    for task in held {
        let _ = task.await;
    }
    limiter.stop().await.unwrap();
}

/// E7: `queueJobForModel` dispatches directly to one model with no escalation — a
/// `Delegate` outcome from the job is treated as an outright failure, not a handoff to
/// the next model in the order.
#[tokio::test]
async fn queue_job_for_model_bypasses_escalation_on_delegate() {
    let cfg = config(
        vec![model("mA", None, Some(1000)), model("mB", None, Some(1000))],
        vec![job_type("chat", 10, 1.0, false)],
        vec!["mA", "mB"],
    );
    let limiter = new_limiter(cfg, "i1").await;
    let cancel = CancellationToken::new();

    let job = |ctx: JobRunContext| async move {
        let _ = ctx;
        Outcome::<()>::Delegate {
            usage: quota_relay::UsageReport {
                input_tokens: 10,
                cached_tokens: 0,
                output_tokens: 0,
            },
        }
    };

    let estimate = quota_relay::Estimate { tokens: 10, requests: 1 };
    let err = limiter
        .queue_job_for_model("job-1", "mA", estimate, job, &cancel)
        .await
        .expect_err("a Delegate outcome must not be retried against mB");
    assert!(
        matches!(err, quota_relay::LimiterError::UserJobError { .. }),
        "delegation on a direct model dispatch surfaces as a user job error, not a capacity error"
    );

    // mB's window is untouched; only mA's was reserved against and then settled.
    let snapshot = limiter.get_model_stats("mB").await.unwrap();
    assert_eq!(snapshot.tpm.unwrap().committed, 0, "the bypassed model never saw a reservation");

    limiter.stop().await.unwrap();
}

/// E6: committing less than the estimate frees the unused portion back to the window
/// immediately — `reserved` drops to zero and only the actual amount is committed.
#[tokio::test]
async fn committing_less_than_estimated_frees_the_difference() {
    let cfg = config(
        vec![model("m1", None, Some(1000))],
        vec![job_type("chat", 100, 1.0, false)],
        vec!["m1"],
    );
    let limiter = new_limiter(cfg, "i1").await;
    let cancel = CancellationToken::new();

    let job = |ctx: JobRunContext| async move {
        let _ = ctx;
        Outcome::Completed {
            data: (),
            usage: quota_relay::UsageReport {
                input_tokens: 40,
                cached_tokens: 0,
                output_tokens: 0,
            },
        }
    };
    limiter.queue_job("job-1", "chat", job, &cancel).await.unwrap();

    let snapshot = limiter.get_model_stats("m1").await.unwrap();
    let tpm = snapshot.tpm.unwrap();
    assert_eq!(tpm.reserved, 0, "the reservation is gone once the attempt settles");
    assert_eq!(tpm.committed, 40, "only the actual usage is committed, not the 100-token estimate");

    limiter.stop().await.unwrap();
}

//! Tests for the orchestration workflow: fan-out, concurrency cap, budget
//! cut-off, pause/resume, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use hydra_db::models::{ForkStatus, JobStatus, NewJob};
use hydra_db::queries::{forks, jobs};
use hydra_test_utils::create_test_pool;

use hydra_core::provider::SandboxProvider;
use hydra_core::provider::mock::{CommandRule, MockProvider};
use hydra_core::retry::RetryPolicy;
use hydra_core::workflow::orchestrator::{OrchestrationResult, run_orchestration};
use hydra_core::workflow::{ForkSettings, OrchestratorSettings};

const COST_LINE: &str = r#"{"cost": 0.5, "input_tokens": 1000, "output_tokens": 500}"#;

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        fork: ForkSettings {
            create_timeout: Duration::from_secs(5),
            create_retry: RetryPolicy::new(3, Duration::from_millis(10), 2.0),
            health_timeout: Duration::from_secs(5),
            agent_retry: RetryPolicy::new(2, Duration::from_millis(10), 2.0),
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_secs(300),
            cleanup_timeout: Duration::from_secs(5),
            cleanup_retry: RetryPolicy::new(3, Duration::from_millis(10), 2.0),
            spend_timeout: Duration::from_secs(5),
        },
        child_retry: RetryPolicy::new(2, Duration::from_millis(10), 2.0),
        execution_headroom: Duration::from_secs(30),
        metrics_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(2),
    }
}

async fn start_job(pool: &SqlitePool, id: &str, mutate: impl FnOnce(&mut NewJob)) {
    let mut new = NewJob {
        id: id.to_string(),
        task_queue: "sandbox-orchestration".to_string(),
        repo_url: "https://example.com/repo.git".to_string(),
        branch: "main".to_string(),
        prompt: "Add a feature".to_string(),
        num_forks: 3,
        model: "sonnet".to_string(),
        max_concurrent: 2,
        fork_timeout_seconds: 60,
        budget_limit_usd: None,
        template: "base".to_string(),
        sandbox_timeout_seconds: 300,
    };
    mutate(&mut new);
    jobs::insert_job(pool, &new).await.unwrap();
    let claimed = jobs::claim_queued(pool, &new.task_queue, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
}

fn agent_provider(delay: Duration, cost_line: &str) -> Arc<MockProvider> {
    let provider = Arc::new(MockProvider::new());
    provider.add_rule(CommandRule::ok("git clone", ""));
    provider.add_rule(CommandRule::ok("claude", cost_line).with_delay(delay));
    provider
}

async fn run_to_completion(
    pool: &SqlitePool,
    provider: Arc<MockProvider>,
    job_id: &str,
    settings: &OrchestratorSettings,
) -> OrchestrationResult {
    run_orchestration(
        pool,
        provider as Arc<dyn SandboxProvider>,
        job_id,
        settings,
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

// S1: happy path, three forks under a cap of two.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_forks_succeed_under_concurrency_cap() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 3;
        j.max_concurrent = 2;
        j.budget_limit_usd = Some(10.0);
    })
    .await;
    let provider = agent_provider(Duration::from_millis(100), COST_LINE);

    let result = run_to_completion(&pool, Arc::clone(&provider), "orch", &fast_settings()).await;

    assert_eq!(result.total_forks, 3);
    assert_eq!(result.successful, 3);
    assert_eq!(result.failed, 0);
    assert!((result.total_cost_usd - 1.5).abs() < 1e-9);
    assert_eq!(result.results.len(), 3);
    assert!(result.total_duration_seconds > 0.0);

    // Results are ordered by fork number with suffixed branches.
    let branches: Vec<&str> = result.results.iter().map(|f| f.fork_branch.as_str()).collect();
    assert_eq!(branches, vec!["main-1", "main-2", "main-3"]);

    // total_cost equals the sum of per-fork costs.
    let sum: f64 = result.results.iter().map(|f| f.cost_usd).sum();
    assert!((result.total_cost_usd - sum).abs() < 1e-9);

    // Never more than two sandboxes alive at once; all three killed.
    assert!(provider.max_alive() <= 2, "max alive: {}", provider.max_alive());
    assert_eq!(provider.killed_ids().len(), 3);
    assert_eq!(provider.alive_count(), 0);

    let job = jobs::get_job(&pool, "orch").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.successful, 3);

    pool.close().await;
}

// S2: budget cut-off mid-fan-out.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_cut_off_stops_admission_mid_fan_out() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 5;
        // Serial execution makes the admission ordering deterministic.
        j.max_concurrent = 1;
        j.budget_limit_usd = Some(1.0);
    })
    .await;
    let provider = agent_provider(
        Duration::ZERO,
        r#"{"cost": 0.6, "input_tokens": 100, "output_tokens": 50}"#,
    );

    let result = run_to_completion(&pool, Arc::clone(&provider), "orch", &fast_settings()).await;

    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 3);
    assert!((result.total_cost_usd - 1.2).abs() < 1e-9);

    let statuses: Vec<ForkStatus> = result.results.iter().map(|f| f.status).collect();
    assert_eq!(
        statuses,
        vec![
            ForkStatus::Success,
            ForkStatus::Success,
            ForkStatus::BudgetExceeded,
            ForkStatus::BudgetExceeded,
            ForkStatus::BudgetExceeded,
        ]
    );

    // Refused forks never created a sandbox.
    assert_eq!(provider.created_count(), 2);

    pool.close().await;
}

// S3: one unhealthy sandbox does not affect its sibling.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unhealthy_fork_fails_in_isolation() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 2;
        j.max_concurrent = 1;
    })
    .await;
    let provider = agent_provider(Duration::ZERO, COST_LINE);
    provider.mark_unhealthy("sbx-2");

    let result = run_to_completion(&pool, Arc::clone(&provider), "orch", &fast_settings()).await;

    assert_eq!(result.results[0].status, ForkStatus::Success);
    assert_eq!(result.results[1].status, ForkStatus::Failed);
    assert_eq!(result.successful, 1);
    assert_eq!(result.failed, 1);

    // Both sandboxes were killed, unhealthy one included.
    let mut killed = provider.killed_ids();
    killed.sort();
    assert_eq!(killed, vec!["sbx-1".to_string(), "sbx-2".to_string()]);

    pool.close().await;
}

// S4: agent timeout becomes a TIMEOUT result with the sandbox killed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agent_timeout_is_reported_and_cleaned_up() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 1;
        j.fork_timeout_seconds = 1;
    })
    .await;
    let provider = agent_provider(Duration::from_secs(120), COST_LINE);

    let result = run_to_completion(&pool, Arc::clone(&provider), "orch", &fast_settings()).await;

    assert_eq!(result.successful, 0);
    assert_eq!(result.failed, 1);
    let fork = &result.results[0];
    assert_eq!(fork.status, ForkStatus::Timeout);
    assert_eq!(fork.cost_usd, 0.0);
    assert!(fork.error.as_ref().unwrap().contains("timed out"));
    assert_eq!(provider.killed_ids().len(), 1);

    pool.close().await;
}

// S5: pause blocks launches; resume releases them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_blocks_launches_until_resume() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 4;
        j.max_concurrent = 4;
    })
    .await;
    jobs::set_paused(&pool, "orch", true).await.unwrap();

    let provider = agent_provider(Duration::from_millis(50), COST_LINE);
    let run_pool = pool.clone();
    let run_provider: Arc<dyn SandboxProvider> = Arc::clone(&provider) as _;
    let handle = tokio::spawn(async move {
        run_orchestration(
            &run_pool,
            run_provider,
            "orch",
            &fast_settings(),
            CancellationToken::new(),
        )
        .await
    });

    // While paused, nothing launches.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.created_count(), 0);
    let job = jobs::get_job(&pool, "orch").await.unwrap().unwrap();
    let progress = jobs::job_progress(&pool, &job).await.unwrap();
    assert!(progress.paused);
    assert_eq!(progress.in_progress, 0);

    // Resume releases all four.
    jobs::set_paused(&pool, "orch", false).await.unwrap();
    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.successful, 4);
    assert_eq!(provider.created_count(), 4);

    pool.close().await;
}

// Cancel stops further launches; in-flight forks complete naturally.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_prevents_new_launches_only() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 3;
        j.max_concurrent = 1;
    })
    .await;

    let provider = agent_provider(Duration::from_millis(400), COST_LINE);
    let run_pool = pool.clone();
    let run_provider: Arc<dyn SandboxProvider> = Arc::clone(&provider) as _;
    let handle = tokio::spawn(async move {
        run_orchestration(
            &run_pool,
            run_provider,
            "orch",
            &fast_settings(),
            CancellationToken::new(),
        )
        .await
    });

    // Wait for fork 1 to be in flight, then cancel.
    loop {
        if forks::get_fork(&pool, "orch", 1).await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    jobs::set_cancelled(&pool, "orch").await.unwrap();

    let result = handle.await.unwrap().unwrap();

    // Fork 1 completed; at least one later fork never launched.
    assert_eq!(result.results[0].status, ForkStatus::Success);
    assert!(result.results.len() < 3, "results: {}", result.results.len());
    assert_eq!(
        result.successful + result.failed,
        result.results.len() as i64
    );

    let job = jobs::get_job(&pool, "orch").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.cancelled);

    pool.close().await;
}

// max_concurrent = num_forks launches everything essentially at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unconstrained_concurrency_overlaps_forks() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 3;
        j.max_concurrent = 3;
    })
    .await;
    let provider = agent_provider(Duration::from_millis(150), COST_LINE);

    let result = run_to_completion(&pool, Arc::clone(&provider), "orch", &fast_settings()).await;

    assert_eq!(result.successful, 3);
    // All three sandboxes were alive at the same time at some point.
    assert_eq!(provider.max_alive(), 3);

    pool.close().await;
}

// Serial execution under max_concurrent = 1.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_concurrent_one_runs_strictly_serially() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 3;
        j.max_concurrent = 1;
    })
    .await;
    let provider = agent_provider(Duration::from_millis(50), COST_LINE);

    let result = run_to_completion(&pool, Arc::clone(&provider), "orch", &fast_settings()).await;

    assert_eq!(result.successful, 3);
    assert_eq!(provider.max_alive(), 1);

    // Completion order follows fork order when serial.
    let mut completed: Vec<(i64, chrono::DateTime<chrono::Utc>)> = result
        .results
        .iter()
        .map(|f| (f.fork_num, f.completed_at.unwrap()))
        .collect();
    completed.sort_by_key(|(_, t)| *t);
    let order: Vec<i64> = completed.iter().map(|(n, _)| *n).collect();
    assert_eq!(order, vec![1, 2, 3]);

    pool.close().await;
}

// Every fork failing still yields a complete OrchestrationResult.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_forks_failing_still_returns_a_result() {
    let pool = create_test_pool().await;
    start_job(&pool, "orch", |j| {
        j.num_forks = 2;
        j.max_concurrent = 2;
    })
    .await;
    let provider = Arc::new(MockProvider::new());
    provider.add_rule(CommandRule::ok("git clone", ""));
    provider.add_rule(CommandRule::fail("claude", 1, "no API key"));

    let result = run_to_completion(&pool, Arc::clone(&provider), "orch", &fast_settings()).await;

    assert_eq!(result.successful, 0);
    assert_eq!(result.failed, 2);
    assert_eq!(result.results.len(), 2);
    assert!(
        result
            .results
            .iter()
            .all(|f| f.status == ForkStatus::Failed)
    );

    let job = jobs::get_job(&pool, "orch").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    pool.close().await;
}

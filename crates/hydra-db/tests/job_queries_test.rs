//! Tests for job submission, claiming, and lifecycle queries.

use hydra_db::models::{JobStatus, NewJob};
use hydra_db::queries::jobs;
use hydra_test_utils::create_test_pool;

fn test_job(id: &str) -> NewJob {
    NewJob {
        id: id.to_string(),
        task_queue: "sandbox-orchestration".to_string(),
        repo_url: "https://example.com/repo.git".to_string(),
        branch: "main".to_string(),
        prompt: "Add a README".to_string(),
        num_forks: 3,
        model: "sonnet".to_string(),
        max_concurrent: 2,
        fork_timeout_seconds: 7200,
        budget_limit_usd: Some(10.0),
        template: "base".to_string(),
        sandbox_timeout_seconds: 300,
    }
}

#[tokio::test]
async fn insert_and_get_round_trip() {
    let pool = create_test_pool().await;

    let inserted = jobs::insert_job(&pool, &test_job("sandbox-orch-aaaa0001"))
        .await
        .unwrap();
    assert_eq!(inserted.status, JobStatus::Queued);
    assert_eq!(inserted.num_forks, 3);
    assert_eq!(inserted.budget_limit_usd, Some(10.0));
    assert!(!inserted.paused);
    assert!(!inserted.cancelled);

    let fetched = jobs::get_job(&pool, "sandbox-orch-aaaa0001")
        .await
        .unwrap()
        .expect("job should exist");
    assert_eq!(fetched.id, inserted.id);
    assert_eq!(fetched.prompt, "Add a README");

    pool.close().await;
}

#[tokio::test]
async fn get_missing_job_returns_none() {
    let pool = create_test_pool().await;
    assert!(jobs::get_job(&pool, "nope").await.unwrap().is_none());
    pool.close().await;
}

#[tokio::test]
async fn claim_moves_queued_to_running_exactly_once() {
    let pool = create_test_pool().await;

    jobs::insert_job(&pool, &test_job("job-1")).await.unwrap();
    jobs::insert_job(&pool, &test_job("job-2")).await.unwrap();

    let first = jobs::claim_queued(&pool, "sandbox-orchestration", 10)
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|j| j.status == JobStatus::Running));
    assert!(first.iter().all(|j| j.started_at.is_some()));

    // A second claim finds nothing left.
    let second = jobs::claim_queued(&pool, "sandbox-orchestration", 10)
        .await
        .unwrap();
    assert!(second.is_empty());

    pool.close().await;
}

#[tokio::test]
async fn claim_is_scoped_to_the_task_queue() {
    let pool = create_test_pool().await;

    let mut other = test_job("job-other-queue");
    other.task_queue = "another-queue".to_string();
    jobs::insert_job(&pool, &other).await.unwrap();

    let claimed = jobs::claim_queued(&pool, "sandbox-orchestration", 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    pool.close().await;
}

#[tokio::test]
async fn pause_cancel_flags_and_missing_job() {
    let pool = create_test_pool().await;
    jobs::insert_job(&pool, &test_job("job-flags")).await.unwrap();

    assert!(jobs::set_paused(&pool, "job-flags", true).await.unwrap());
    let job = jobs::get_job(&pool, "job-flags").await.unwrap().unwrap();
    assert!(job.paused);

    assert!(jobs::set_paused(&pool, "job-flags", false).await.unwrap());
    assert!(jobs::set_cancelled(&pool, "job-flags").await.unwrap());
    let job = jobs::get_job(&pool, "job-flags").await.unwrap().unwrap();
    assert!(!job.paused);
    assert!(job.cancelled);

    assert!(!jobs::set_paused(&pool, "missing", true).await.unwrap());
    assert!(!jobs::set_cancelled(&pool, "missing").await.unwrap());

    pool.close().await;
}

#[tokio::test]
async fn complete_job_records_duration() {
    let pool = create_test_pool().await;
    jobs::insert_job(&pool, &test_job("job-done")).await.unwrap();

    jobs::update_totals(&pool, "job-done", 2, 1, 1.5).await.unwrap();
    jobs::complete_job(&pool, "job-done", 42.5).await.unwrap();

    let job = jobs::get_job(&pool, "job-done").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.successful, 2);
    assert_eq!(job.failed_forks, 1);
    assert_eq!(job.total_cost_usd, 1.5);
    assert_eq!(job.total_duration_seconds, Some(42.5));
    assert!(job.completed_at.is_some());

    pool.close().await;
}

#[tokio::test]
async fn fail_job_records_error() {
    let pool = create_test_pool().await;
    jobs::insert_job(&pool, &test_job("job-bad")).await.unwrap();

    jobs::fail_job(&pool, "job-bad", "provider unreachable")
        .await
        .unwrap();

    let job = jobs::get_job(&pool, "job-bad").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("provider unreachable"));

    pool.close().await;
}

#[tokio::test]
async fn list_recent_respects_limit() {
    let pool = create_test_pool().await;
    for i in 0..5 {
        jobs::insert_job(&pool, &test_job(&format!("job-{i}")))
            .await
            .unwrap();
    }

    let listed = jobs::list_recent(&pool, 3).await.unwrap();
    assert_eq!(listed.len(), 3);

    pool.close().await;
}

//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Job, JobProgress, JobStatus, NewJob};

/// Insert a new job in `queued` status. Returns the inserted row.
pub async fn insert_job(pool: &SqlitePool, new: &NewJob) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (id, task_queue, repo_url, branch, prompt, num_forks, model, \
                           max_concurrent, fork_timeout_seconds, budget_limit_usd, template, \
                           sandbox_timeout_seconds, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.task_queue)
    .bind(&new.repo_url)
    .bind(&new.branch)
    .bind(&new.prompt)
    .bind(new.num_forks)
    .bind(&new.model)
    .bind(new.max_concurrent)
    .bind(new.fork_timeout_seconds)
    .bind(new.budget_limit_usd)
    .bind(&new.template)
    .bind(new.sandbox_timeout_seconds)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert job")?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// Atomically claim up to `limit` queued jobs on a task queue, moving them to
/// `running`. Each job is delivered to exactly one claimant.
pub async fn claim_queued(pool: &SqlitePool, task_queue: &str, limit: i64) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?) \
         WHERE id IN (SELECT id FROM jobs \
                      WHERE status = 'queued' AND task_queue = ? \
                      ORDER BY created_at ASC LIMIT ?) \
         RETURNING *",
    )
    .bind(Utc::now())
    .bind(task_queue)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to claim queued jobs")?;

    Ok(jobs)
}

/// List jobs already in `running` status on a task queue (crash recovery).
pub async fn running_jobs(pool: &SqlitePool, task_queue: &str) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE status = 'running' AND task_queue = ? ORDER BY created_at ASC",
    )
    .bind(task_queue)
    .fetch_all(pool)
    .await
    .context("failed to list running jobs")?;

    Ok(jobs)
}

/// List the most recently created jobs.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("failed to list jobs")?;

    Ok(jobs)
}

/// Set or clear the paused flag. Returns false if the job does not exist.
pub async fn set_paused(pool: &SqlitePool, id: &str, paused: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE jobs SET paused = ? WHERE id = ?")
        .bind(paused)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set paused flag")?;

    Ok(result.rows_affected() > 0)
}

/// Set the sticky cancelled flag. Returns false if the job does not exist.
pub async fn set_cancelled(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE jobs SET cancelled = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set cancelled flag")?;

    Ok(result.rows_affected() > 0)
}

/// Update the running aggregate counters after a fork reaches terminal state.
pub async fn update_totals(
    pool: &SqlitePool,
    id: &str,
    successful: i64,
    failed_forks: i64,
    total_cost_usd: f64,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET successful = ?, failed_forks = ?, total_cost_usd = ? WHERE id = ?",
    )
    .bind(successful)
    .bind(failed_forks)
    .bind(total_cost_usd)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update job totals")?;

    Ok(())
}

/// Mark a job completed and record its wall-clock duration.
pub async fn complete_job(pool: &SqlitePool, id: &str, total_duration_seconds: f64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'completed', completed_at = ?, total_duration_seconds = ? \
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(total_duration_seconds)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to complete job")?;

    Ok(())
}

/// Mark a job failed with an infrastructure error.
pub async fn fail_job(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = 'failed', completed_at = ?, error = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(error)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to fail job")?;

    Ok(())
}

/// Derive the live progress view of a job from its fork rows.
pub async fn job_progress(pool: &SqlitePool, job: &Job) -> Result<JobProgress> {
    let (completed, failed, in_progress, total_cost_usd): (i64, i64, i64, f64) = sqlx::query_as(
        "SELECT \
             COALESCE(SUM(status = 'success'), 0), \
             COALESCE(SUM(status NOT IN ('success', 'pending', 'running')), 0), \
             COALESCE(SUM(status IN ('pending', 'running')), 0), \
             COALESCE(SUM(cost_usd), 0.0) \
         FROM forks WHERE job_id = ?",
    )
    .bind(&job.id)
    .fetch_one(pool)
    .await
    .context("failed to compute job progress")?;

    Ok(JobProgress {
        total: job.num_forks,
        completed,
        failed,
        in_progress,
        total_cost_usd,
        paused: job.paused,
        cancelled: job.cancelled,
    })
}

/// Whether a job is in a terminal status.
pub fn is_terminal(status: JobStatus) -> bool {
    matches!(status, JobStatus::Completed | JobStatus::Failed)
}

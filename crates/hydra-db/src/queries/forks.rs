//! Database query functions for the `forks` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Fork, ForkStep, ForkTerminal};

/// Fetch the fork row for `(job_id, fork_num)`, creating it in `pending` /
/// `admission` state if absent.
///
/// Idempotent: a resumed fork gets its existing row (with recorded step and
/// sandbox) back.
pub async fn get_or_create(
    pool: &SqlitePool,
    job_id: &str,
    fork_num: i64,
    workflow_id: &str,
    fork_branch: &str,
) -> Result<Fork> {
    sqlx::query(
        "INSERT INTO forks (job_id, fork_num, workflow_id, fork_branch) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (job_id, fork_num) DO NOTHING",
    )
    .bind(job_id)
    .bind(fork_num)
    .bind(workflow_id)
    .bind(fork_branch)
    .execute(pool)
    .await
    .context("failed to insert fork")?;

    let fork = get_fork(pool, job_id, fork_num)
        .await?
        .with_context(|| format!("fork {job_id}/{fork_num} vanished after insert"))?;

    Ok(fork)
}

/// Fetch a fork by its workflow id.
pub async fn get_by_workflow_id(pool: &SqlitePool, workflow_id: &str) -> Result<Option<Fork>> {
    let fork = sqlx::query_as::<_, Fork>("SELECT * FROM forks WHERE workflow_id = ?")
        .bind(workflow_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch fork by workflow id")?;

    Ok(fork)
}

/// Fetch a single fork.
pub async fn get_fork(pool: &SqlitePool, job_id: &str, fork_num: i64) -> Result<Option<Fork>> {
    let fork =
        sqlx::query_as::<_, Fork>("SELECT * FROM forks WHERE job_id = ? AND fork_num = ?")
            .bind(job_id)
            .bind(fork_num)
            .fetch_optional(pool)
            .await
            .context("failed to fetch fork")?;

    Ok(fork)
}

/// List all forks of a job, ordered by fork number.
pub async fn list_forks(pool: &SqlitePool, job_id: &str) -> Result<Vec<Fork>> {
    let forks =
        sqlx::query_as::<_, Fork>("SELECT * FROM forks WHERE job_id = ? ORDER BY fork_num ASC")
            .bind(job_id)
            .fetch_all(pool)
            .await
            .context("failed to list forks")?;

    Ok(forks)
}

/// Move a fork to `running` and stamp `started_at` on first entry.
pub async fn mark_running(pool: &SqlitePool, job_id: &str, fork_num: i64) -> Result<()> {
    sqlx::query(
        "UPDATE forks SET status = 'running', started_at = COALESCE(started_at, ?) \
         WHERE job_id = ? AND fork_num = ?",
    )
    .bind(Utc::now())
    .bind(job_id)
    .bind(fork_num)
    .execute(pool)
    .await
    .context("failed to mark fork running")?;

    Ok(())
}

/// Record the step a fork is about to execute.
pub async fn set_step(pool: &SqlitePool, job_id: &str, fork_num: i64, step: ForkStep) -> Result<()> {
    sqlx::query("UPDATE forks SET step = ? WHERE job_id = ? AND fork_num = ?")
        .bind(step)
        .bind(job_id)
        .bind(fork_num)
        .execute(pool)
        .await
        .context("failed to set fork step")?;

    Ok(())
}

/// Record the sandbox owned by a fork, immediately after creation returns.
pub async fn record_sandbox(
    pool: &SqlitePool,
    job_id: &str,
    fork_num: i64,
    sandbox_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE forks SET sandbox_id = ? WHERE job_id = ? AND fork_num = ?")
        .bind(sandbox_id)
        .bind(job_id)
        .bind(fork_num)
        .execute(pool)
        .await
        .context("failed to record sandbox id")?;

    Ok(())
}

/// Clear the sandbox reference after a successful kill.
pub async fn clear_sandbox(pool: &SqlitePool, job_id: &str, fork_num: i64) -> Result<()> {
    sqlx::query("UPDATE forks SET sandbox_id = NULL WHERE job_id = ? AND fork_num = ?")
        .bind(job_id)
        .bind(fork_num)
        .execute(pool)
        .await
        .context("failed to clear sandbox id")?;

    Ok(())
}

/// Stamp an activity heartbeat on a fork.
pub async fn record_heartbeat(
    pool: &SqlitePool,
    job_id: &str,
    fork_num: i64,
    payload: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE forks SET heartbeat_at = ?, heartbeat_payload = ? \
         WHERE job_id = ? AND fork_num = ?",
    )
    .bind(Utc::now())
    .bind(payload)
    .bind(job_id)
    .bind(fork_num)
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;

    Ok(())
}

/// Request cooperative cancellation of a single fork.
pub async fn request_cancel(pool: &SqlitePool, job_id: &str, fork_num: i64) -> Result<bool> {
    let result =
        sqlx::query("UPDATE forks SET cancel_requested = 1 WHERE job_id = ? AND fork_num = ?")
            .bind(job_id)
            .bind(fork_num)
            .execute(pool)
            .await
            .context("failed to request fork cancellation")?;

    Ok(result.rows_affected() > 0)
}

/// Write a fork's terminal outcome.
///
/// Guarded so an already-terminal fork is never overwritten: a fork reaches
/// a terminal status at most once.
pub async fn record_terminal(
    pool: &SqlitePool,
    job_id: &str,
    fork_num: i64,
    terminal: &ForkTerminal,
) -> Result<()> {
    sqlx::query(
        "UPDATE forks SET status = ?, step = 'done', cost_usd = ?, input_tokens = ?, \
                          output_tokens = ?, duration_seconds = ?, output = ?, error = ?, \
                          completed_at = ? \
         WHERE job_id = ? AND fork_num = ? AND status IN ('pending', 'running')",
    )
    .bind(terminal.status)
    .bind(terminal.cost_usd)
    .bind(terminal.input_tokens)
    .bind(terminal.output_tokens)
    .bind(terminal.duration_seconds)
    .bind(&terminal.output)
    .bind(&terminal.error)
    .bind(Utc::now())
    .bind(job_id)
    .bind(fork_num)
    .execute(pool)
    .await
    .context("failed to record fork terminal state")?;

    Ok(())
}

/// Reset a fork for a fresh attempt after a child-level retry.
pub async fn reset_for_retry(pool: &SqlitePool, job_id: &str, fork_num: i64) -> Result<()> {
    sqlx::query(
        "UPDATE forks SET status = 'pending', step = 'admission', attempt = attempt + 1, \
                          sandbox_id = NULL, heartbeat_at = NULL, heartbeat_payload = NULL \
         WHERE job_id = ? AND fork_num = ?",
    )
    .bind(job_id)
    .bind(fork_num)
    .execute(pool)
    .await
    .context("failed to reset fork for retry")?;

    Ok(())
}

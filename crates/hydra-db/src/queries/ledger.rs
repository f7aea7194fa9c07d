//! The spend ledger: authoritative per-job cost, keyed by `(workflow_id,
//! fork_num)` so re-recording a fork's final cost is idempotent.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

/// Record a fork's final cost against its parent workflow.
///
/// Upserts on `(workflow_id, fork_num)`: agent retries and workflow resumes
/// cannot double-count. Returns the new cumulative spend for the workflow.
pub async fn add_spend(
    pool: &SqlitePool,
    workflow_id: &str,
    fork_num: i64,
    cost_usd: f64,
) -> Result<f64> {
    sqlx::query(
        "INSERT INTO spend_ledger (workflow_id, fork_num, cost_usd, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (workflow_id, fork_num) \
         DO UPDATE SET cost_usd = excluded.cost_usd, updated_at = excluded.updated_at",
    )
    .bind(workflow_id)
    .bind(fork_num)
    .bind(cost_usd)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to record spend")?;

    read_spend(pool, workflow_id).await
}

/// Cumulative spend for a workflow.
pub async fn read_spend(pool: &SqlitePool, workflow_id: &str) -> Result<f64> {
    let total: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(cost_usd), 0.0) FROM spend_ledger WHERE workflow_id = ?",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to read spend")?;

    Ok(total)
}

//! Database query functions for the singleton `janitor` row.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::JanitorState;

/// Fetch the janitor state.
pub async fn get_state(pool: &SqlitePool) -> Result<JanitorState> {
    let state = sqlx::query_as::<_, JanitorState>(
        "SELECT interval_minutes, max_age_minutes, running, stop_requested, total_cleaned, \
                last_cleanup_at, started_at \
         FROM janitor WHERE id = 1",
    )
    .fetch_one(pool)
    .await
    .context("failed to fetch janitor state")?;

    Ok(state)
}

/// Arm the janitor with the given schedule.
///
/// Returns `false` (leaving the existing schedule untouched) when the
/// janitor is already running.
pub async fn arm(pool: &SqlitePool, interval_minutes: i64, max_age_minutes: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE janitor SET interval_minutes = ?, max_age_minutes = ?, running = 1, \
                            stop_requested = 0, started_at = ? \
         WHERE id = 1 AND running = 0",
    )
    .bind(interval_minutes)
    .bind(max_age_minutes)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to arm janitor")?;

    Ok(result.rows_affected() > 0)
}

/// Request the janitor stop after its current scan.
pub async fn request_stop(pool: &SqlitePool) -> Result<()> {
    sqlx::query("UPDATE janitor SET stop_requested = 1 WHERE id = 1")
        .execute(pool)
        .await
        .context("failed to request janitor stop")?;

    Ok(())
}

/// Record the outcome of one sweep.
pub async fn record_sweep(pool: &SqlitePool, cleaned: i64) -> Result<()> {
    sqlx::query(
        "UPDATE janitor SET total_cleaned = total_cleaned + ?, last_cleanup_at = ? WHERE id = 1",
    )
    .bind(cleaned)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to record janitor sweep")?;

    Ok(())
}

/// Mark the janitor stopped.
pub async fn mark_stopped(pool: &SqlitePool) -> Result<()> {
    sqlx::query("UPDATE janitor SET running = 0, stop_requested = 0 WHERE id = 1")
        .execute(pool)
        .await
        .context("failed to mark janitor stopped")?;

    Ok(())
}

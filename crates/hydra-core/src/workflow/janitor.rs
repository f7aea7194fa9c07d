//! The janitor: a periodic sweep that reaps orphaned sandboxes.
//!
//! Armed via the singleton janitor row (`hydra cleanup`), hosted by the
//! worker. Each sweep lists sandboxes, keeps those older than the age
//! threshold with no live owning workflow, and kills them. The stop signal
//! is honored between sweeps, not mid-scan; scans are short.

use anyhow::Result;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hydra_db::models::JanitorState;
use hydra_db::queries::janitor as janitor_db;

use crate::activities::sandbox;
use crate::provider::SandboxProvider;

/// How often the inter-sweep sleep re-checks the stop flag.
const STOP_POLL: Duration = Duration::from_secs(1);

/// Summary returned when the janitor stops.
#[derive(Debug, Clone)]
pub struct JanitorSummary {
    pub total_cleaned: i64,
    pub last_cleanup_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Run the janitor until its stop flag is set or the worker shuts down.
pub async fn run_janitor(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    cancel: CancellationToken,
) -> Result<JanitorSummary> {
    let state = janitor_db::get_state(pool).await?;
    info!(
        interval_minutes = state.interval_minutes,
        max_age_minutes = state.max_age_minutes,
        "janitor started"
    );

    loop {
        let state = janitor_db::get_state(pool).await?;
        if state.stop_requested || cancel.is_cancelled() {
            break;
        }

        if let Err(e) = sweep(pool, provider, &state).await {
            // A failed sweep never stops the janitor.
            error!(error = %e, "janitor sweep failed");
        }

        let interval = Duration::from_secs((state.interval_minutes.max(1) as u64) * 60);
        if sleep_until_stop(pool, interval, &cancel).await? {
            break;
        }
    }

    // Worker shutdown leaves the janitor armed so the next worker re-hosts
    // it; only an operator stop disarms it.
    let state = janitor_db::get_state(pool).await?;
    if state.stop_requested {
        janitor_db::mark_stopped(pool).await?;
    }
    info!(total_cleaned = state.total_cleaned, "janitor stopped");

    Ok(JanitorSummary {
        total_cleaned: state.total_cleaned,
        last_cleanup_at: state.last_cleanup_at,
    })
}

/// One sweep: scan for orphans and kill them.
async fn sweep(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    state: &JanitorState,
) -> Result<()> {
    let orphans = sandbox::find_orphaned_sandboxes(pool, provider, state.max_age_minutes).await?;
    if orphans.is_empty() {
        return Ok(());
    }

    let mut cleaned = 0;
    for sandbox_id in &orphans {
        match sandbox::kill_sandbox(provider, sandbox_id).await {
            Ok(_) => {
                cleaned += 1;
                info!(sandbox_id, "orphaned sandbox killed");
            }
            Err(e) => {
                error!(sandbox_id, error = %e, "failed to kill orphaned sandbox");
            }
        }
    }

    if cleaned > 0 {
        janitor_db::record_sweep(pool, cleaned).await?;
        let state = janitor_db::get_state(pool).await?;
        info!(
            cleaned,
            total_cleaned = state.total_cleaned,
            "orphaned sandboxes cleaned up"
        );
    }

    Ok(())
}

/// Sleep for `interval`, waking early when stop is requested or the worker
/// shuts down. Returns true when the janitor should stop.
async fn sleep_until_stop(
    pool: &SqlitePool,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + interval;
    loop {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        let state = janitor_db::get_state(pool).await?;
        if state.stop_requested {
            return Ok(true);
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        let nap = STOP_POLL.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = cancel.cancelled() => return Ok(true),
        }
    }
}

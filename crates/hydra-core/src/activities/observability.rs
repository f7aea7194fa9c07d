//! Observability activities: metrics recording and the spend ledger.
//!
//! The ledger lives behind this activity surface so workflows never touch
//! shared mutable state directly; the store serializes updates.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use hydra_db::models::Fork;
use hydra_db::queries::ledger;

use crate::metrics;

/// Record metrics for a fork that reached terminal state. Infallible by
/// construction; metric failures must never affect the result.
pub async fn record_metrics(workflow_id: &str, model: &str, fork: &Fork) {
    let status = fork.status.to_string();

    metrics::FORK_COMPLETED
        .with_label_values(&[&status, model])
        .inc();
    metrics::FORK_DURATION
        .with_label_values(&[&status])
        .observe(fork.duration_seconds);
    metrics::FORK_COST
        .with_label_values(&[model])
        .observe(fork.cost_usd);

    info!(
        workflow_id,
        fork_num = fork.fork_num,
        status = %status,
        cost_usd = fork.cost_usd,
        duration = fork.duration_seconds,
        "metrics recorded"
    );
}

/// Current spend for a workflow, in USD.
pub async fn read_spend(pool: &SqlitePool, workflow_id: &str) -> Result<f64> {
    ledger::read_spend(pool, workflow_id).await
}

/// Record a fork's final cost. Idempotent per fork; returns the new total.
pub async fn add_spend(
    pool: &SqlitePool,
    workflow_id: &str,
    fork_num: i64,
    cost_usd: f64,
) -> Result<f64> {
    let total = ledger::add_spend(pool, workflow_id, fork_num, cost_usd).await?;
    info!(workflow_id, fork_num, cost_usd, total, "spend recorded");
    Ok(total)
}

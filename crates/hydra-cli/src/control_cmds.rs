//! `hydra pause` / `resume` / `cancel` commands: signal a running workflow.

use anyhow::{Result, bail};
use console::style;
use sqlx::SqlitePool;

use hydra_db::queries::jobs;

/// Pause the launch loop of a workflow.
pub async fn run_pause(pool: &SqlitePool, workflow_id: &str) -> Result<()> {
    if !jobs::set_paused(pool, workflow_id, true).await? {
        bail!("workflow {workflow_id} not found");
    }
    println!("{}", style(format!("Workflow {workflow_id} paused")).yellow());
    Ok(())
}

/// Resume a paused workflow.
pub async fn run_resume(pool: &SqlitePool, workflow_id: &str) -> Result<()> {
    if !jobs::set_paused(pool, workflow_id, false).await? {
        bail!("workflow {workflow_id} not found");
    }
    println!("{}", style(format!("Workflow {workflow_id} resumed")).green());
    Ok(())
}

/// Request graceful cancellation: no new forks launch, in-flight forks
/// complete naturally.
pub async fn run_cancel(pool: &SqlitePool, workflow_id: &str) -> Result<()> {
    if !jobs::set_cancelled(pool, workflow_id).await? {
        bail!("workflow {workflow_id} not found");
    }
    println!(
        "{}",
        style(format!("Cancel signal sent to {workflow_id}")).yellow()
    );
    println!("In-progress forks will complete; no new forks will start.");
    Ok(())
}

//! `hydra status` command: progress and per-fork detail for one workflow.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use hydra_db::queries::{forks, jobs};

use crate::display;

/// Run the status command.
pub async fn run_status(pool: &SqlitePool, workflow_id: &str) -> Result<()> {
    let job = jobs::get_job(pool, workflow_id)
        .await?
        .with_context(|| format!("workflow {workflow_id} not found"))?;

    let progress = jobs::job_progress(pool, &job).await?;
    display::print_progress(&job, &progress);

    let results = forks::list_forks(pool, workflow_id).await?;
    if !results.is_empty() {
        println!();
        display::print_fork_table(&results);
    }

    Ok(())
}

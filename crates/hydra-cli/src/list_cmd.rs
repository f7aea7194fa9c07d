//! `hydra list` command: recent workflows with a progress summary.

use anyhow::Result;
use sqlx::SqlitePool;

use hydra_db::queries::jobs;

/// Run the list command.
pub async fn run_list(pool: &SqlitePool, limit: i64) -> Result<()> {
    let listed = jobs::list_recent(pool, limit).await?;

    if listed.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    println!(
        "{:<24} {:<11} {:>6} {:>10} {:>10}  {}",
        "WORKFLOW ID", "STATUS", "FORKS", "OK/FAIL", "COST", "STARTED"
    );
    println!("{}", "-".repeat(86));

    for job in &listed {
        let started = job
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<11} {:>6} {:>10} {:>10}  {}",
            job.id,
            job.status.to_string(),
            job.num_forks,
            format!("{}/{}", job.successful, job.failed_forks),
            format!("${:.4}", job.total_cost_usd),
            started,
        );
    }

    Ok(())
}

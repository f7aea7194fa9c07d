//! `hydra fork` command: submit an orchestration job and optionally wait
//! for it.

use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use sqlx::SqlitePool;

use hydra_core::worker::task_queue_from_env;
use hydra_db::models::{JobStatus, NewJob};
use hydra_db::queries::{forks, jobs};

use crate::display;

/// Options collected from the command line.
pub struct ForkOptions {
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub num_forks: i64,
    pub model: String,
    pub max_concurrent: i64,
    pub timeout: i64,
    pub budget: Option<f64>,
    pub wait: bool,
}

/// How often `--wait` polls the job.
const WAIT_POLL: Duration = Duration::from_millis(500);

/// Run the fork command. Returns the process exit code.
pub async fn run_fork(pool: &SqlitePool, options: ForkOptions) -> Result<i32> {
    let workflow_id = format!("sandbox-orch-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

    let new = NewJob {
        id: workflow_id.clone(),
        task_queue: task_queue_from_env(),
        repo_url: options.repo_url,
        branch: options.branch,
        prompt: options.prompt,
        num_forks: options.num_forks.max(1),
        model: options.model,
        max_concurrent: options.max_concurrent.max(1),
        fork_timeout_seconds: options.timeout,
        budget_limit_usd: options.budget,
        template: "base".to_string(),
        sandbox_timeout_seconds: 300,
    };

    println!();
    println!("{}", style("Starting orchestration workflow").bold().blue());
    println!("  Workflow ID: {}", style(&workflow_id).green());
    println!("  Repository: {}", new.repo_url);
    println!("  Branch: {}", new.branch);
    println!("  Forks: {}", new.num_forks);
    println!("  Model: {}", new.model);
    println!("  Max concurrent: {}", new.max_concurrent);
    if let Some(budget) = new.budget_limit_usd {
        println!("  Budget: ${budget:.2}");
    }
    println!();

    jobs::insert_job(pool, &new).await?;
    println!("{}", style("Workflow started!").green());

    if !options.wait {
        println!("Use `hydra status {workflow_id}` to check progress.");
        return Ok(0);
    }

    println!("{}", style("Waiting for completion...").bold());
    println!();

    loop {
        let job = jobs::get_job(pool, &workflow_id)
            .await?
            .with_context(|| format!("job {workflow_id} disappeared from the store"))?;

        if jobs::is_terminal(job.status) {
            let results = forks::list_forks(pool, &workflow_id).await?;
            display::print_fork_table(&results);
            display::print_summary(&job, &results);

            if job.status == JobStatus::Failed {
                eprintln!(
                    "{}",
                    style(format!(
                        "Workflow failed: {}",
                        job.error.as_deref().unwrap_or("unknown error")
                    ))
                    .red()
                );
                return Ok(1);
            }
            return Ok(0);
        }

        tokio::time::sleep(WAIT_POLL).await;
    }
}

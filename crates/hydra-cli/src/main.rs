mod cleanup_cmd;
mod config;
mod control_cmds;
mod display;
mod fork_cmd;
mod list_cmd;
mod status_cmd;
mod worker_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;

use hydra_db::pool;

#[derive(Parser)]
#[command(name = "hydra", about = "Durable parallel sandbox orchestrator for LLM coding agents")]
struct Cli {
    /// Database URL (overrides HYDRA_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch parallel sandbox forks
    Fork {
        /// Git repository URL
        repo_url: String,
        /// Git branch
        #[arg(long, short = 'b', default_value = "main")]
        branch: String,
        /// Prompt for the agents
        #[arg(long, short = 'p')]
        prompt: String,
        /// Number of forks
        #[arg(long = "forks", short = 'f', default_value_t = 1)]
        num_forks: i64,
        /// Agent model
        #[arg(long, short = 'm', default_value = "sonnet")]
        model: String,
        /// Max concurrent forks
        #[arg(long, default_value_t = 5)]
        max_concurrent: i64,
        /// Timeout per fork (seconds)
        #[arg(long, short = 't', default_value_t = 7200)]
        timeout: i64,
        /// Budget limit (USD)
        #[arg(long)]
        budget: Option<f64>,
        /// Wait for completion (default)
        #[arg(long, overrides_with = "no_wait")]
        wait: bool,
        /// Submit and return immediately
        #[arg(long, overrides_with = "wait")]
        no_wait: bool,
    },
    /// Check progress of a workflow
    Status {
        /// Workflow ID to check
        workflow_id: String,
    },
    /// Cancel a workflow (in-progress forks finish naturally)
    Cancel {
        /// Workflow ID to cancel
        workflow_id: String,
    },
    /// Pause launching new forks
    Pause {
        /// Workflow ID to pause
        workflow_id: String,
    },
    /// Resume a paused workflow
    Resume {
        /// Workflow ID to resume
        workflow_id: String,
    },
    /// List recent workflows
    List {
        /// Max workflows to show
        #[arg(long, short = 'l', default_value_t = 10)]
        limit: i64,
    },
    /// Start the scheduled orphaned-sandbox cleanup
    Cleanup {
        /// Cleanup interval (minutes)
        #[arg(long, short = 'i', default_value_t = 15)]
        interval: i64,
        /// Max sandbox age before reclaim (minutes)
        #[arg(long, default_value_t = 180)]
        max_age: i64,
    },
    /// Stop the scheduled cleanup
    StopCleanup,
    /// Run the worker that hosts workflows and activities
    Worker,
}

async fn open_pool(cli_db_url: Option<&str>) -> Result<SqlitePool> {
    let db_config = config::resolve_db_config(cli_db_url);
    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&db_pool).await?;
    Ok(db_pool)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_pool = open_pool(cli.database_url.as_deref()).await?;

    let exit_code = match cli.command {
        Commands::Fork {
            repo_url,
            branch,
            prompt,
            num_forks,
            model,
            max_concurrent,
            timeout,
            budget,
            wait: _,
            no_wait,
        } => {
            let options = fork_cmd::ForkOptions {
                repo_url,
                branch,
                prompt,
                num_forks,
                model,
                max_concurrent,
                timeout,
                budget,
                wait: !no_wait,
            };
            let code = fork_cmd::run_fork(&db_pool, options).await;
            db_pool.close().await;
            code?
        }
        Commands::Status { workflow_id } => {
            let result = status_cmd::run_status(&db_pool, &workflow_id).await;
            db_pool.close().await;
            result?;
            0
        }
        Commands::Cancel { workflow_id } => {
            let result = control_cmds::run_cancel(&db_pool, &workflow_id).await;
            db_pool.close().await;
            result?;
            0
        }
        Commands::Pause { workflow_id } => {
            let result = control_cmds::run_pause(&db_pool, &workflow_id).await;
            db_pool.close().await;
            result?;
            0
        }
        Commands::Resume { workflow_id } => {
            let result = control_cmds::run_resume(&db_pool, &workflow_id).await;
            db_pool.close().await;
            result?;
            0
        }
        Commands::List { limit } => {
            let result = list_cmd::run_list(&db_pool, limit).await;
            db_pool.close().await;
            result?;
            0
        }
        Commands::Cleanup { interval, max_age } => {
            let result = cleanup_cmd::run_cleanup(&db_pool, interval, max_age).await;
            db_pool.close().await;
            result?;
            0
        }
        Commands::StopCleanup => {
            let result = cleanup_cmd::run_stop_cleanup(&db_pool).await;
            db_pool.close().await;
            result?;
            0
        }
        Commands::Worker => {
            let result = worker_cmd::run_worker(db_pool.clone()).await;
            db_pool.close().await;
            result?;
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}

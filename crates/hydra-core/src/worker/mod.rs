//! The worker runtime: a long-lived process that claims queued jobs from
//! its task queue, resumes interrupted ones, and hosts the janitor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hydra_db::models::Job;
use hydra_db::queries::{forks, janitor as janitor_db, jobs};

use crate::provider::SandboxProvider;
use crate::workflow::OrchestratorSettings;
use crate::workflow::janitor::run_janitor;
use crate::workflow::orchestrator::{Interrupted, run_orchestration};

/// Environment variable naming the task queue to poll.
pub const TASK_QUEUE_ENV: &str = "HYDRA_TASK_QUEUE";

/// Default task queue name.
pub const DEFAULT_TASK_QUEUE: &str = "sandbox-orchestration";

/// Task queue from the environment, with the default fallback.
pub fn task_queue_from_env() -> String {
    std::env::var(TASK_QUEUE_ENV).unwrap_or_else(|_| DEFAULT_TASK_QUEUE.to_string())
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub task_queue: String,
    /// How often the queue is polled for new jobs.
    pub poll_interval: Duration,
    /// Cap on orchestrations driven concurrently by this worker.
    pub max_concurrent_jobs: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            poll_interval: Duration::from_secs(1),
            max_concurrent_jobs: 8,
        }
    }
}

/// Hosts orchestration workflows and the janitor for one task queue.
pub struct Worker {
    pool: SqlitePool,
    provider: Arc<dyn SandboxProvider>,
    config: WorkerConfig,
    settings: OrchestratorSettings,
}

impl Worker {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn SandboxProvider>,
        config: WorkerConfig,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            provider,
            config,
            settings,
        }
    }

    /// Run until cancelled. Recovers interrupted jobs first, then polls the
    /// queue; the janitor is (re)started whenever its row says armed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            task_queue = %self.config.task_queue,
            "worker started, waiting for jobs"
        );

        let mut orchestrations: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut active: HashSet<String> = HashSet::new();
        let mut janitor_task: Option<tokio::task::JoinHandle<()>> = None;

        // Crash recovery: jobs already claimed by a previous worker run
        // resume at the step their forks were interrupted in.
        for job in jobs::running_jobs(&self.pool, &self.config.task_queue).await? {
            info!(job_id = %job.id, "resuming interrupted job");
            self.spawn_orchestration(&mut orchestrations, &mut active, job.id, &cancel);
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Reap finished orchestrations.
            while let Some(joined) = orchestrations.try_join_next() {
                match joined {
                    Ok((job_id, result)) => {
                        active.remove(&job_id);
                        self.record_job_outcome(&job_id, result).await;
                    }
                    Err(e) => error!(error = %e, "orchestration task panicked"),
                }
            }

            // Claim new jobs up to the concurrency budget.
            let slots = self
                .config
                .max_concurrent_jobs
                .saturating_sub(orchestrations.len());
            if slots > 0 {
                let claimed =
                    jobs::claim_queued(&self.pool, &self.config.task_queue, slots as i64).await?;
                for job in claimed {
                    info!(job_id = %job.id, "claimed job");
                    self.spawn_orchestration(&mut orchestrations, &mut active, job.id, &cancel);
                }
            }

            // Adopt running jobs nobody is driving (their worker died)
            // once their heartbeats go stale past the heartbeat timeout.
            if orchestrations.len() < self.config.max_concurrent_jobs {
                for job in jobs::running_jobs(&self.pool, &self.config.task_queue).await? {
                    if active.contains(&job.id)
                        || orchestrations.len() >= self.config.max_concurrent_jobs
                    {
                        continue;
                    }
                    if self.job_is_stalled(&job).await? {
                        warn!(job_id = %job.id, "adopting stalled job");
                        self.spawn_orchestration(&mut orchestrations, &mut active, job.id, &cancel);
                    }
                }
            }

            // Host the janitor while its row says armed.
            let janitor_alive = janitor_task.as_ref().is_some_and(|t| !t.is_finished());
            if !janitor_alive && janitor_db::get_state(&self.pool).await?.running {
                let pool = self.pool.clone();
                let provider = Arc::clone(&self.provider);
                let token = cancel.child_token();
                janitor_task = Some(tokio::spawn(async move {
                    if let Err(e) = run_janitor(&pool, provider.as_ref(), token).await {
                        error!(error = %e, "janitor exited with error");
                    }
                }));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("worker shutting down, draining orchestrations");
        while let Some(joined) = orchestrations.join_next().await {
            match joined {
                Ok((job_id, result)) => self.record_job_outcome(&job_id, result).await,
                Err(e) => error!(error = %e, "orchestration task panicked during drain"),
            }
        }
        if let Some(task) = janitor_task {
            let _ = task.await;
        }
        info!("worker shutdown complete");

        Ok(())
    }

    /// Book-keep a finished orchestration run.
    ///
    /// Interrupted runs (worker shutdown, drain timeout) stay `running` so
    /// the next worker resumes them; any other error is an infrastructure
    /// failure and is recorded on the job row -- otherwise the job would
    /// sit in `running` forever and be re-adopted on every stall scan.
    async fn record_job_outcome(&self, job_id: &str, result: Result<()>) {
        match result {
            Ok(()) => info!(job_id, "job finished"),
            Err(e) if e.downcast_ref::<Interrupted>().is_some() => {
                info!(job_id, "job interrupted, left running for resume");
            }
            Err(e) => {
                error!(job_id, error = %e, "job run failed");
                if let Err(db_err) = jobs::fail_job(&self.pool, job_id, &e.to_string()).await {
                    error!(job_id, error = %db_err, "failed to record job failure");
                }
            }
        }
    }

    /// Whether a running job has shown no sign of life for longer than the
    /// heartbeat timeout.
    async fn job_is_stalled(&self, job: &Job) -> Result<bool> {
        let job_forks = forks::list_forks(&self.pool, &job.id).await?;
        let last_activity = job_forks
            .iter()
            .filter_map(|f| f.heartbeat_at)
            .max()
            .or(job.started_at)
            .unwrap_or(job.created_at);

        let stale_for = (Utc::now() - last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Ok(stale_for > self.settings.fork.heartbeat_timeout)
    }

    fn spawn_orchestration(
        &self,
        orchestrations: &mut JoinSet<(String, Result<()>)>,
        active: &mut HashSet<String>,
        job_id: String,
        cancel: &CancellationToken,
    ) {
        let pool = self.pool.clone();
        let provider = Arc::clone(&self.provider);
        let settings = self.settings.clone();
        let token = cancel.child_token();
        active.insert(job_id.clone());
        orchestrations.spawn(async move {
            let result = run_orchestration(&pool, provider, &job_id, &settings, token)
                .await
                .map(|_| ());
            (job_id, result)
        });
    }
}

//! The orchestration workflow: fan out fork children under a concurrency
//! cap, honor pause/resume/cancel, and aggregate results.
//!
//! Forks are launched in fork-number order and joined in launch order. The
//! launch loop suspends while paused and while the semaphore is exhausted;
//! the sticky cancel flag stops further launches but never interrupts
//! in-flight forks. A fork whose child run fails with an infrastructure
//! error is retried at the child level, then translated into a FAILED
//! result -- the orchestration itself only fails on store errors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hydra_db::models::{Fork, ForkStatus, ForkTerminal, Job, JobStatus};
use hydra_db::queries::{forks, jobs};

use crate::activities::observability;
use crate::provider::SandboxProvider;
use crate::workflow::fork::run_fork;
use crate::workflow::{OrchestratorSettings, fork_branch, fork_workflow_id};

/// Marker error: the orchestration stopped because the worker is shutting
/// down. The job stays `running` and resumes on the next worker; the
/// worker must not record it as failed.
#[derive(Debug, thiserror::Error)]
#[error("orchestration interrupted by worker shutdown: {0}")]
pub struct Interrupted(pub String);

/// Terminal summary of an orchestration.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub workflow_id: String,
    pub total_forks: i64,
    pub successful: i64,
    pub failed: i64,
    pub total_cost_usd: f64,
    pub total_duration_seconds: f64,
    pub results: Vec<Fork>,
}

/// A launched fork: either already terminal from a previous run, or a live
/// task to join.
enum Launched {
    Ready(Fork),
    Task(JoinHandle<Result<Fork>>),
}

/// Run (or resume) an orchestration job to completion.
pub async fn run_orchestration(
    pool: &SqlitePool,
    provider: Arc<dyn SandboxProvider>,
    job_id: &str,
    settings: &OrchestratorSettings,
    cancel: CancellationToken,
) -> Result<OrchestrationResult> {
    let job = jobs::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    if jobs::is_terminal(job.status) {
        // Resume of a finished job: rebuild the summary from the rows.
        return build_result(pool, &job).await;
    }
    if job.status != JobStatus::Running {
        bail!("job {job_id} has status {}, expected running", job.status);
    }

    info!(
        job_id,
        num_forks = job.num_forks,
        max_concurrent = job.max_concurrent,
        "starting orchestration"
    );

    let semaphore = Arc::new(Semaphore::new(job.max_concurrent.max(1) as usize));
    let mut launched: Vec<(i64, Launched)> = Vec::with_capacity(job.num_forks as usize);
    let mut interrupted = false;

    // Launch phase.
    for fork_num in 1..=job.num_forks {
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }

        let existing = forks::get_fork(pool, &job.id, fork_num).await?;
        if let Some(fork) = &existing {
            if fork.status.is_terminal() {
                launched.push((fork_num, Launched::Ready(fork.clone())));
                continue;
            }
        }
        // An in-flight fork from a previous worker run is resumed even if
        // the job has since been cancelled; a fresh one is subject to the
        // cancel and pause signals.
        let resuming = existing.is_some();

        if !resuming {
            if job_cancelled(pool, &job.id).await? {
                info!(job_id, fork_num, "cancelled, not launching further forks");
                break;
            }

            // Suspend while paused. Resume or cancel unblocks.
            if !wait_while_paused(pool, &job.id, settings, &cancel).await? {
                interrupted = true;
                break;
            }
        }

        // Suspend until a concurrency slot frees up.
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                permit.context("semaphore closed")?
            }
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
        };

        // Cancel may have landed during the slot wait; a not-yet-started
        // fork must not launch past it.
        if !resuming && job_cancelled(pool, &job.id).await? {
            info!(job_id, fork_num, "cancelled while waiting for a slot");
            break;
        }

        let handle = spawn_fork(pool.clone(), Arc::clone(&provider), job.clone(), fork_num, settings.clone(), permit);
        launched.push((fork_num, Launched::Task(handle)));
        info!(job_id, fork_num, "started fork");
    }

    // Join phase, in launch order.
    let mut successful: i64 = 0;
    let mut failed: i64 = 0;
    let mut total_cost: f64 = 0.0;
    let drain_deadline = tokio::time::Instant::now() + settings.drain_timeout;

    for (fork_num, entry) in launched {
        let fork = match entry {
            Launched::Ready(fork) => fork,
            Launched::Task(handle) => {
                join_fork(pool, &job, fork_num, handle, interrupted, drain_deadline).await?
            }
        };

        if fork.status == ForkStatus::Success {
            successful += 1;
        } else {
            failed += 1;
        }
        total_cost += fork.cost_usd;

        info!(
            job_id,
            fork_num,
            status = %fork.status,
            cost_usd = fork.cost_usd,
            "fork joined"
        );

        jobs::update_totals(pool, &job.id, successful, failed, total_cost).await?;

        // Metrics are best-effort and bounded.
        match timeout(
            settings.metrics_timeout,
            observability::record_metrics(&job.id, &job.model, &fork),
        )
        .await
        {
            Ok(()) => {}
            Err(_) => warn!(job_id, fork_num, "metrics recording timed out"),
        }
    }

    if interrupted {
        // Leave the job running; the next worker resumes it.
        return Err(Interrupted(format!("job {job_id} left mid-launch")).into());
    }

    let duration = job
        .started_at
        .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0)
        .max(0.0);
    jobs::complete_job(pool, &job.id, duration).await?;

    let job = jobs::get_job(pool, &job.id)
        .await?
        .with_context(|| format!("job {job_id} vanished at completion"))?;
    let result = build_result(pool, &job).await?;

    info!(
        job_id,
        successful = result.successful,
        failed = result.failed,
        total_cost_usd = result.total_cost_usd,
        duration = result.total_duration_seconds,
        "orchestration completed"
    );

    Ok(result)
}

async fn job_cancelled(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let job = jobs::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} vanished"))?;
    Ok(job.cancelled)
}

/// Suspend while the job is paused. Returns false when the worker is
/// shutting down.
async fn wait_while_paused(
    pool: &SqlitePool,
    job_id: &str,
    settings: &OrchestratorSettings,
    cancel: &CancellationToken,
) -> Result<bool> {
    loop {
        let job = jobs::get_job(pool, job_id)
            .await?
            .with_context(|| format!("job {job_id} vanished"))?;
        if !job.paused || job.cancelled {
            return Ok(true);
        }
        tokio::select! {
            _ = tokio::time::sleep(settings.poll_interval) => {}
            _ = cancel.cancelled() => return Ok(false),
        }
    }
}

/// Spawn one fork with child-level retries and the execution timeout.
fn spawn_fork(
    pool: SqlitePool,
    provider: Arc<dyn SandboxProvider>,
    job: Job,
    fork_num: i64,
    settings: OrchestratorSettings,
    permit: tokio::sync::OwnedSemaphorePermit,
) -> JoinHandle<Result<Fork>> {
    tokio::spawn(async move {
        let execution_timeout = Duration::from_secs(job.fork_timeout_seconds.max(1) as u64)
            + settings.execution_headroom;

        let mut attempt = 1;
        let result = loop {
            let run = timeout(
                execution_timeout,
                run_fork(&pool, provider.as_ref(), &job, fork_num, &settings.fork),
            )
            .await;

            match run {
                Ok(Ok(fork)) => break Ok(fork),
                Ok(Err(e)) => {
                    if attempt >= settings.child_retry.maximum_attempts {
                        break Err(e);
                    }
                    warn!(
                        job_id = %job.id,
                        fork_num,
                        attempt,
                        error = %e,
                        "fork run failed, retrying"
                    );
                    forks::reset_for_retry(&pool, &job.id, fork_num).await?;
                    tokio::time::sleep(
                        settings
                            .child_retry
                            .initial_interval
                            .mul_f64(settings.child_retry.backoff_coefficient.powi(attempt as i32 - 1)),
                    )
                    .await;
                    attempt += 1;
                }
                Err(_) => {
                    // Execution timeout: force-terminate, no retry. The
                    // sandbox (if any) is left to the janitor.
                    break Err(anyhow::anyhow!(
                        "fork execution timeout exceeded ({execution_timeout:?})"
                    ));
                }
            }
        };

        drop(permit);
        result
    })
}

/// Join one spawned fork, translating child failures into FAILED results.
async fn join_fork(
    pool: &SqlitePool,
    job: &Job,
    fork_num: i64,
    handle: JoinHandle<Result<Fork>>,
    draining: bool,
    drain_deadline: tokio::time::Instant,
) -> Result<Fork> {
    let joined = if draining {
        match tokio::time::timeout_at(drain_deadline, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // Drain window expired; the fork resumes on the next worker.
                return Err(Interrupted(format!(
                    "drain timeout expired waiting for fork {fork_num}"
                ))
                .into());
            }
        }
    } else {
        handle.await
    };

    let error = match joined {
        Ok(Ok(fork)) => return Ok(fork),
        Ok(Err(e)) => e.to_string(),
        Err(join_err) => {
            error!(job_id = %job.id, fork_num, error = %join_err, "fork task panicked");
            format!("fork task panicked: {join_err}")
        }
    };

    // Child failed after retries: record a FAILED result in its place.
    let workflow_id = fork_workflow_id(&job.id, fork_num);
    let branch = fork_branch(&job.branch, fork_num, job.num_forks);
    forks::get_or_create(pool, &job.id, fork_num, &workflow_id, &branch).await?;
    forks::record_terminal(
        pool,
        &job.id,
        fork_num,
        &ForkTerminal {
            status: ForkStatus::Failed,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            duration_seconds: 0.0,
            output: None,
            error: Some(error),
        },
    )
    .await?;

    forks::get_fork(pool, &job.id, fork_num)
        .await?
        .with_context(|| format!("fork {workflow_id} vanished after failure record"))
}

/// Build the terminal summary from the job and fork rows.
async fn build_result(pool: &SqlitePool, job: &Job) -> Result<OrchestrationResult> {
    let results = forks::list_forks(pool, &job.id).await?;
    let successful = results
        .iter()
        .filter(|f| f.status == ForkStatus::Success)
        .count() as i64;
    let failed = results
        .iter()
        .filter(|f| f.status.is_terminal() && f.status != ForkStatus::Success)
        .count() as i64;
    let total_cost_usd = results.iter().map(|f| f.cost_usd).sum();

    Ok(OrchestrationResult {
        workflow_id: job.id.clone(),
        total_forks: job.num_forks,
        successful,
        failed,
        total_cost_usd,
        total_duration_seconds: job.total_duration_seconds.unwrap_or(0.0),
        results,
    })
}

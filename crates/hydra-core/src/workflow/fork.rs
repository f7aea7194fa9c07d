//! The fork workflow: one sandbox, one agent run, guaranteed cleanup.
//!
//! The state machine is `pending -> running -> terminal`, driven through
//! persisted steps (`admission -> create_sandbox -> health_check ->
//! run_agent -> cleanup -> done`). Each step is written to the fork row
//! before it executes, so a restarted worker re-enters the fork at exactly
//! the step it was interrupted in. The cleanup block always runs once a
//! sandbox id has been recorded; if it fails after retries, the janitor is
//! the safety net.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::time::timeout;
use tracing::{info, warn};

use hydra_db::models::{Fork, ForkStatus, ForkStep, ForkTerminal, Job};
use hydra_db::queries::forks;

use crate::activities::agent::{self, AgentError, AgentInput, AgentOutcome};
use crate::activities::observability;
use crate::activities::sandbox;
use crate::activities::ActivityContext;
use crate::provider::{FORK_NUM_KEY, ProviderError, SandboxProvider};
use crate::retry::with_retry;

use super::{ForkSettings, fork_branch, fork_workflow_id};

/// What the fork decided to end with, before the cleanup block runs.
struct TerminalDecision {
    status: ForkStatus,
    cost_usd: f64,
    input_tokens: i64,
    output_tokens: i64,
    output: Option<String>,
    error: Option<String>,
}

impl TerminalDecision {
    fn bare(status: ForkStatus, error: Option<String>) -> Self {
        Self {
            status,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            output: None,
            error,
        }
    }

    fn from_agent(outcome: AgentOutcome) -> Self {
        Self {
            status: outcome.status,
            cost_usd: outcome.cost_usd,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            output: outcome.output,
            error: outcome.error,
        }
    }
}

/// Run (or resume) one fork to terminal state. Returns the terminal fork
/// row.
///
/// Infrastructure errors (store failures, mostly) propagate as `Err` after
/// the cleanup block has run; reaching a terminal status -- including
/// `failed`, `timeout`, `budget_exceeded` -- is `Ok`.
pub async fn run_fork(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    job: &Job,
    fork_num: i64,
    settings: &ForkSettings,
) -> Result<Fork> {
    let workflow_id = fork_workflow_id(&job.id, fork_num);
    let branch = fork_branch(&job.branch, fork_num, job.num_forks);

    let fork = forks::get_or_create(pool, &job.id, fork_num, &workflow_id, &branch).await?;
    if fork.status.is_terminal() {
        // Resume of an already-finished fork: nothing to do.
        return Ok(fork);
    }

    info!(
        workflow_id = %workflow_id,
        repo_url = %job.repo_url,
        branch = %branch,
        step = %fork.step,
        "starting fork"
    );

    forks::mark_running(pool, &job.id, fork_num).await?;

    let decision = drive_steps(pool, provider, job, &fork, &workflow_id, &branch, settings).await;

    // Cleanup always runs before the fork completes, whatever the outcome.
    cleanup_sandbox(pool, provider, &job.id, fork_num, settings).await?;

    let decision = decision?;
    let terminal = ForkTerminal {
        status: decision.status,
        cost_usd: decision.cost_usd,
        input_tokens: decision.input_tokens,
        output_tokens: decision.output_tokens,
        duration_seconds: duration_since_start(pool, &job.id, fork_num).await?,
        output: decision.output,
        error: decision.error,
    };
    forks::record_terminal(pool, &job.id, fork_num, &terminal).await?;

    let fork = forks::get_fork(pool, &job.id, fork_num)
        .await?
        .with_context(|| format!("fork {workflow_id} vanished at terminal write"))?;

    info!(
        workflow_id = %workflow_id,
        status = %fork.status,
        cost_usd = fork.cost_usd,
        duration = fork.duration_seconds,
        "fork completed"
    );

    Ok(fork)
}

/// Execute the fork's steps from wherever the persisted step says to
/// resume, returning the terminal decision.
async fn drive_steps(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    job: &Job,
    fork: &Fork,
    workflow_id: &str,
    branch: &str,
    settings: &ForkSettings,
) -> Result<TerminalDecision> {
    let mut step = fork.step;

    // Admission: refuse to provision anything once the budget is spent.
    if step == ForkStep::Admission {
        if let Some(decision) = check_budget(pool, job, settings).await? {
            return Ok(decision);
        }
        step = ForkStep::CreateSandbox;
        forks::set_step(pool, &job.id, fork.fork_num, step).await?;
    }

    if step == ForkStep::CreateSandbox {
        if cancel_requested(pool, &job.id, fork.fork_num).await? {
            return Ok(cancelled_decision(workflow_id));
        }
        match create_sandbox_step(pool, provider, job, fork.fork_num, workflow_id, settings).await {
            Ok(sandbox_id) => {
                forks::record_sandbox(pool, &job.id, fork.fork_num, &sandbox_id).await?;
                step = ForkStep::HealthCheck;
                forks::set_step(pool, &job.id, fork.fork_num, step).await?;
            }
            Err(e) => {
                return Ok(TerminalDecision::bare(ForkStatus::Failed, Some(e.to_string())));
            }
        }
    }

    // Past this point the fork owns a sandbox.
    let sandbox_id = forks::get_fork(pool, &job.id, fork.fork_num)
        .await?
        .and_then(|f| f.sandbox_id)
        .with_context(|| format!("fork {workflow_id} has no sandbox past creation"))?;

    if step == ForkStep::HealthCheck {
        if cancel_requested(pool, &job.id, fork.fork_num).await? {
            return Ok(cancelled_decision(workflow_id));
        }
        let health = match timeout(
            settings.health_timeout,
            sandbox::health_check(provider, &sandbox_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                return Ok(TerminalDecision::bare(
                    ForkStatus::Failed,
                    Some(format!("health check timed out for sandbox {sandbox_id}")),
                ));
            }
        };

        if !health.is_healthy {
            return Ok(TerminalDecision::bare(
                ForkStatus::Failed,
                Some(format!(
                    "sandbox {sandbox_id} is not healthy: {}",
                    health.error.as_deref().unwrap_or("unresponsive")
                )),
            ));
        }

        step = ForkStep::RunAgent;
        forks::set_step(pool, &job.id, fork.fork_num, step).await?;
    }

    if step == ForkStep::RunAgent {
        if cancel_requested(pool, &job.id, fork.fork_num).await? {
            return Ok(cancelled_decision(workflow_id));
        }
        return run_agent_step(pool, provider, job, fork.fork_num, workflow_id, branch, &sandbox_id, settings)
            .await;
    }

    // A fork resumed in `cleanup`/`done` with a non-terminal status was
    // interrupted mid-finalization; its agent outcome was never recorded.
    Ok(TerminalDecision::bare(
        ForkStatus::Failed,
        Some("fork interrupted during finalization".to_string()),
    ))
}

/// Budget admission check. `Some(decision)` refuses admission.
async fn check_budget(
    pool: &SqlitePool,
    job: &Job,
    settings: &ForkSettings,
) -> Result<Option<TerminalDecision>> {
    let Some(budget) = job.budget_limit_usd else {
        return Ok(None);
    };

    let spend = timeout(settings.spend_timeout, observability::read_spend(pool, &job.id))
        .await
        .context("spend read timed out")??;

    if spend >= budget {
        info!(job_id = %job.id, spend, budget, "budget exhausted at admission");
        return Ok(Some(TerminalDecision::bare(
            ForkStatus::BudgetExceeded,
            Some(format!(
                "budget limit ${budget} exceeded (current: ${spend})"
            )),
        )));
    }

    Ok(None)
}

/// Sandbox creation with per-attempt timeout and the creation retry policy.
async fn create_sandbox_step(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    job: &Job,
    fork_num: i64,
    workflow_id: &str,
    settings: &ForkSettings,
) -> Result<String, ProviderError> {
    let mut metadata = HashMap::new();
    metadata.insert(FORK_NUM_KEY.to_string(), fork_num.to_string());

    let sandbox = with_retry(
        &settings.create_retry,
        ProviderError::is_retryable,
        |attempt| {
            let ctx = ActivityContext::new(
                pool.clone(),
                &job.id,
                fork_num,
                workflow_id,
                "create-sandbox",
                attempt,
            );
            let metadata = metadata.clone();
            async move {
                match timeout(
                    settings.create_timeout,
                    sandbox::create_sandbox(
                        provider,
                        &ctx,
                        &job.template,
                        job.sandbox_timeout_seconds,
                        None,
                        metadata,
                    ),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transport(format!(
                        "sandbox creation attempt timed out after {:?}",
                        settings.create_timeout
                    ))),
                }
            }
        },
    )
    .await?;

    Ok(sandbox.sandbox_id)
}

/// The agent step: retries, the start-to-close timeout, spend recording,
/// and mapping the outcome to a terminal decision.
#[allow(clippy::too_many_arguments)]
async fn run_agent_step(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    job: &Job,
    fork_num: i64,
    workflow_id: &str,
    branch: &str,
    sandbox_id: &str,
    settings: &ForkSettings,
) -> Result<TerminalDecision> {
    let input = AgentInput {
        sandbox_id: sandbox_id.to_string(),
        prompt: job.prompt.clone(),
        model: job.model.clone(),
        fork_num,
        repo_url: job.repo_url.clone(),
        branch: branch.to_string(),
        max_turns: 100,
    };
    let start_to_close = Duration::from_secs(job.fork_timeout_seconds.max(1) as u64);

    let agent_result = with_retry(
        &settings.agent_retry,
        AgentError::is_retryable,
        |attempt| {
            let ctx = ActivityContext::new(
                pool.clone(),
                &job.id,
                fork_num,
                workflow_id,
                "run-agent",
                attempt,
            );
            let input = input.clone();
            async move {
                match timeout(
                    start_to_close,
                    agent::run_agent(provider, &ctx, &input, settings.heartbeat_interval),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout(format!(
                        "start-to-close timeout of {}s reached",
                        job.fork_timeout_seconds
                    ))),
                }
            }
        },
    )
    .await;

    match agent_result {
        Ok(outcome) => {
            // Record the final attempt's cost; the ledger upsert keyed by
            // fork makes re-recording idempotent.
            let recorded = timeout(
                settings.spend_timeout,
                observability::add_spend(pool, &job.id, fork_num, outcome.cost_usd),
            )
            .await;
            match recorded {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(workflow_id = %workflow_id, error = %e, "spend write failed"),
                Err(_) => warn!(workflow_id = %workflow_id, "spend write timed out"),
            }

            Ok(TerminalDecision::from_agent(outcome))
        }
        Err(AgentError::Timeout(msg)) => Ok(TerminalDecision::bare(
            ForkStatus::Timeout,
            Some(format!("agent execution timed out: {msg}")),
        )),
        Err(AgentError::BudgetExceeded(msg)) => Ok(TerminalDecision::bare(
            ForkStatus::BudgetExceeded,
            Some(msg),
        )),
        Err(AgentError::Execution(msg)) => {
            Ok(TerminalDecision::bare(ForkStatus::Failed, Some(msg)))
        }
    }
}

/// Kill the fork's sandbox if it owns one. Failures are logged, never
/// propagated: the janitor reclaims whatever slips through.
async fn cleanup_sandbox(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    job_id: &str,
    fork_num: i64,
    settings: &ForkSettings,
) -> Result<()> {
    let Some(fork) = forks::get_fork(pool, job_id, fork_num).await? else {
        return Ok(());
    };
    let Some(sandbox_id) = fork.sandbox_id else {
        return Ok(());
    };

    forks::set_step(pool, job_id, fork_num, ForkStep::Cleanup).await?;

    let killed = with_retry(
        &settings.cleanup_retry,
        ProviderError::is_retryable,
        |_attempt| async {
            match timeout(
                settings.cleanup_timeout,
                sandbox::kill_sandbox(provider, &sandbox_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transport(format!(
                    "kill attempt timed out after {:?}",
                    settings.cleanup_timeout
                ))),
            }
        },
    )
    .await;

    match killed {
        Ok(_) => {
            forks::clear_sandbox(pool, job_id, fork_num).await?;
            info!(job_id, fork_num, sandbox_id = %sandbox_id, "sandbox cleaned up");
        }
        Err(e) => {
            // The janitor will reclaim it.
            warn!(
                job_id,
                fork_num,
                sandbox_id = %sandbox_id,
                error = %e,
                "sandbox cleanup failed, leaving to the janitor"
            );
        }
    }

    Ok(())
}

async fn cancel_requested(pool: &SqlitePool, job_id: &str, fork_num: i64) -> Result<bool> {
    Ok(forks::get_fork(pool, job_id, fork_num)
        .await?
        .map(|f| f.cancel_requested)
        .unwrap_or(false))
}

fn cancelled_decision(workflow_id: &str) -> TerminalDecision {
    info!(workflow_id = %workflow_id, "fork cancelled by request");
    TerminalDecision::bare(
        ForkStatus::Cancelled,
        Some("execution cancelled by request".to_string()),
    )
}

/// Wall-clock seconds since the fork first entered `running`.
async fn duration_since_start(pool: &SqlitePool, job_id: &str, fork_num: i64) -> Result<f64> {
    let fork = forks::get_fork(pool, job_id, fork_num).await?;
    let started = fork.and_then(|f| f.started_at);
    Ok(started
        .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0)
        .max(0.0))
}

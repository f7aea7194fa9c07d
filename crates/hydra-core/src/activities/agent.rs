//! The agent activity: clone the repo inside the sandbox, pipe the prompt
//! to the agent CLI, heartbeat while it runs, and parse the cost line.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hydra_db::models::ForkStatus;
use hydra_db::queries::forks;

use crate::provider::{CommandRequest, ProviderError, SandboxProvider};

use super::ActivityContext;

/// Matches the flat cost object the agent CLI prints, e.g.
/// `{"cost": 0.5, "input_tokens": 1000, "output_tokens": 500}`.
static COST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{[^{}]*"cost"[^{}]*\}"#).expect("valid cost-line regex")
});

/// Maximum characters of agent output retained on the fork result.
const OUTPUT_TAIL_CHARS: usize = 10_000;

/// Wall-clock cap for the clone + checkout step.
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Input to the agent run.
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub sandbox_id: String,
    pub prompt: String,
    pub model: String,
    pub fork_num: i64,
    pub repo_url: String,
    pub branch: String,
    pub max_turns: i64,
}

/// Outcome of one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub status: ForkStatus,
    pub cost_usd: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Agent activity errors, classified for the workflow's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent hit its execution timeout. Non-retryable.
    #[error("agent execution timed out: {0}")]
    Timeout(String),

    /// The agent reported its budget exhausted. Non-retryable.
    #[error("agent budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Anything else that prevented the run from completing.
    #[error("agent execution failed: {0}")]
    Execution(String),
}

impl AgentError {
    /// Whether the agent retry policy should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_))
    }
}

/// Run the agent CLI inside the sandbox.
///
/// A background task heartbeats every `heartbeat_interval` while the CLI
/// runs; the caller bounds the whole activity with its start-to-close
/// timeout.
pub async fn run_agent(
    provider: &dyn SandboxProvider,
    ctx: &ActivityContext,
    input: &AgentInput,
    heartbeat_interval: Duration,
) -> Result<AgentOutcome, AgentError> {
    info!(
        workflow_id = %ctx.workflow_id,
        sandbox_id = %input.sandbox_id,
        fork_num = input.fork_num,
        model = %input.model,
        "starting agent execution"
    );
    ctx.heartbeat(&json!({"status": "starting", "fork_num": input.fork_num}))
        .await;

    clone_repository(provider, ctx, input).await?;

    // Aborted on drop, so the loop dies with the activity even when the
    // caller's start-to-close timeout cancels this future mid-run.
    let _heartbeat = AbortOnDrop(spawn_heartbeat_loop(
        ctx.pool.clone(),
        ctx.job_id.clone(),
        input.fork_num,
        heartbeat_interval,
    ));

    execute_agent(provider, ctx, input).await
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Clone the repository and check out the fork branch inside the sandbox.
///
/// A failed clone is a warning, not an error: the agent may still be able
/// to work (e.g. the branch already exists from a previous attempt).
async fn clone_repository(
    provider: &dyn SandboxProvider,
    ctx: &ActivityContext,
    input: &AgentInput,
) -> Result<(), AgentError> {
    let clone_cmd = format!(
        "git clone {repo} /workspace && cd /workspace && \
         (git checkout -b {branch} origin/{branch} 2>/dev/null || \
          git checkout {branch} 2>/dev/null || \
          git checkout -b {branch})",
        repo = input.repo_url,
        branch = input.branch,
    );

    info!(repo_url = %input.repo_url, branch = %input.branch, "cloning repository");

    let clone_result = provider
        .run_command(
            &input.sandbox_id,
            &CommandRequest::new(clone_cmd, CLONE_TIMEOUT),
        )
        .await
        .map_err(|e| match e {
            ProviderError::CommandTimeout { .. } => AgentError::Timeout(e.to_string()),
            other => AgentError::Execution(other.to_string()),
        })?;

    if clone_result.exit_code != 0 {
        warn!(
            exit_code = clone_result.exit_code,
            stderr = %clone_result.stderr,
            "clone returned non-zero"
        );
    }

    ctx.heartbeat(&json!({"status": "repo_cloned", "fork_num": input.fork_num}))
        .await;
    Ok(())
}

/// Invoke the agent CLI and translate its output into an [`AgentOutcome`].
async fn execute_agent(
    provider: &dyn SandboxProvider,
    ctx: &ActivityContext,
    input: &AgentInput,
) -> Result<AgentOutcome, AgentError> {
    let escaped_prompt = shell_escape_single(&input.prompt);

    let agent_cmd = format!(
        "cd /workspace && echo '{prompt}' | claude -p \
         --model {model} \
         --max-turns {max_turns} \
         --dangerously-skip-permissions \
         --output-format json 2>&1",
        prompt = escaped_prompt,
        model = input.model,
        max_turns = input.max_turns,
    );

    // Roughly one minute of wall time per turn.
    let agent_timeout = Duration::from_secs((input.max_turns.max(1) as u64) * 60);

    let request = CommandRequest {
        command: agent_cmd,
        cwd: Some("/workspace".to_string()),
        timeout: agent_timeout,
        envs: Default::default(),
    };

    let result = provider
        .run_command(&input.sandbox_id, &request)
        .await
        .map_err(|e| match e {
            ProviderError::CommandTimeout { .. } => AgentError::Timeout(e.to_string()),
            other => AgentError::Execution(other.to_string()),
        })?;

    ctx.heartbeat(&json!({"status": "completed", "fork_num": input.fork_num}))
        .await;

    let (cost_usd, input_tokens, output_tokens) = parse_cost_line(&result.stdout);

    let status = if result.exit_code == 0 {
        ForkStatus::Success
    } else {
        ForkStatus::Failed
    };
    let error = (result.exit_code != 0 && !result.stderr.is_empty()).then(|| result.stderr.clone());

    info!(
        workflow_id = %ctx.workflow_id,
        status = %status,
        exit_code = result.exit_code,
        cost_usd,
        input_tokens,
        output_tokens,
        "agent execution completed"
    );

    Ok(AgentOutcome {
        status,
        cost_usd,
        input_tokens,
        output_tokens,
        output: Some(tail(&result.stdout, OUTPUT_TAIL_CHARS)),
        error,
    })
}

/// Background heartbeat loop; aborted by the caller when the agent returns.
fn spawn_heartbeat_loop(
    pool: SqlitePool,
    job_id: String,
    fork_num: i64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut iteration: u64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            iteration += 1;
            let payload = json!({
                "status": "running",
                "fork_num": fork_num,
                "heartbeat_iteration": iteration,
            })
            .to_string();
            if let Err(e) = forks::record_heartbeat(&pool, &job_id, fork_num, &payload).await {
                warn!(job_id = %job_id, fork_num, error = %e, "heartbeat write failed");
            }
        }
    })
}

/// Extract `(cost, input_tokens, output_tokens)` from the first flat cost
/// object in the agent output. Absence means zero cost, not an error.
fn parse_cost_line(output: &str) -> (f64, i64, i64) {
    let Some(m) = COST_LINE.find(output) else {
        return (0.0, 0, 0);
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(m.as_str()) else {
        return (0.0, 0, 0);
    };

    let cost = value.get("cost").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let input_tokens = value
        .get("input_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let output_tokens = value
        .get("output_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    (cost, input_tokens, output_tokens)
}

/// Escape a string for interpolation inside single quotes in `sh -c`.
fn shell_escape_single(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

/// Last `max_chars` characters of `s`, on a char boundary.
fn tail(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(char_count - max_chars).collect()
}

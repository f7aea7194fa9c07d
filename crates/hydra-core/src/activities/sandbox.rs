//! Sandbox provider activities: create, health-check, kill, orphan scan.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use hydra_db::models::JobStatus;
use hydra_db::queries::{forks as forks_db, jobs as jobs_db};

use crate::provider::{
    ACTIVITY_ID_KEY, CommandRequest, CreateRequest, ProviderError, SandboxInfo, SandboxProvider,
    WORKFLOW_ID_KEY,
};

use super::ActivityContext;

/// Environment variables forwarded into every sandbox when set.
const PASSTHROUGH_ENVS: &[&str] = &["ANTHROPIC_API_KEY", "GITHUB_TOKEN"];

/// Result of a sandbox health probe. Never an error: an unreachable sandbox
/// reports `is_healthy = false`.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub sandbox_id: String,
    pub is_healthy: bool,
    pub is_running: bool,
    pub error: Option<String>,
}

/// Create a sandbox and verify it came up.
///
/// Stamps the reserved `workflow_id` / `activity_id` metadata keys and
/// forwards credential env vars before the provider call, so the sandbox is
/// attributable from the moment it exists.
pub async fn create_sandbox(
    provider: &dyn SandboxProvider,
    ctx: &ActivityContext,
    template: &str,
    timeout_seconds: i64,
    envs: Option<HashMap<String, String>>,
    extra_metadata: HashMap<String, String>,
) -> Result<SandboxInfo, ProviderError> {
    ctx.heartbeat(&json!("creating_sandbox")).await;

    let mut sandbox_envs = envs.unwrap_or_default();
    for key in PASSTHROUGH_ENVS {
        if let Ok(value) = std::env::var(key) {
            sandbox_envs.insert((*key).to_string(), value);
        }
    }

    let mut metadata = extra_metadata;
    metadata.insert(WORKFLOW_ID_KEY.to_string(), ctx.workflow_id.clone());
    metadata.insert(ACTIVITY_ID_KEY.to_string(), ctx.activity_id.clone());

    let request = CreateRequest {
        template: template.to_string(),
        timeout_seconds,
        envs: sandbox_envs,
        metadata,
    };

    let sandbox = provider.create(&request).await?;
    ctx.heartbeat(&json!("sandbox_created")).await;

    // Verify the sandbox actually came up before handing it to the workflow.
    let running = provider
        .is_running(&sandbox.sandbox_id)
        .await
        .unwrap_or(false);
    if !running {
        return Err(ProviderError::Creation(format!(
            "sandbox {} not running after create",
            sandbox.sandbox_id
        )));
    }
    ctx.heartbeat(&json!("sandbox_verified")).await;

    info!(
        workflow_id = %ctx.workflow_id,
        sandbox_id = %sandbox.sandbox_id,
        hostname = sandbox.hostname.as_deref().unwrap_or("-"),
        "sandbox created"
    );

    Ok(sandbox)
}

/// Probe a sandbox with a trivial command.
pub async fn health_check(provider: &dyn SandboxProvider, sandbox_id: &str) -> HealthCheckResult {
    let is_running = match provider.is_running(sandbox_id).await {
        Ok(running) => running,
        Err(e) => {
            warn!(sandbox_id, error = %e, "health check failed");
            return HealthCheckResult {
                sandbox_id: sandbox_id.to_string(),
                is_healthy: false,
                is_running: false,
                error: Some(e.to_string()),
            };
        }
    };

    if !is_running {
        return HealthCheckResult {
            sandbox_id: sandbox_id.to_string(),
            is_healthy: false,
            is_running: false,
            error: None,
        };
    }

    let probe = CommandRequest::new("echo health_check", Duration::from_secs(10));
    match provider.run_command(sandbox_id, &probe).await {
        Ok(output) => HealthCheckResult {
            sandbox_id: sandbox_id.to_string(),
            is_healthy: output.exit_code == 0,
            is_running: true,
            error: (output.exit_code != 0).then(|| output.stderr),
        },
        Err(e) => {
            warn!(sandbox_id, error = %e, "health probe command failed");
            HealthCheckResult {
                sandbox_id: sandbox_id.to_string(),
                is_healthy: false,
                is_running: true,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Kill a sandbox. Idempotent: "already gone" is success.
///
/// Transport errors propagate so the caller's retry policy applies.
pub async fn kill_sandbox(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
) -> Result<bool, ProviderError> {
    match provider.kill(sandbox_id).await {
        Ok(()) => {
            info!(sandbox_id, "sandbox killed");
            Ok(true)
        }
        Err(ProviderError::NotFound(_)) => {
            debug!(sandbox_id, "sandbox already gone");
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Find sandboxes older than `max_age_minutes` that no live workflow owns:
/// either the metadata lacks the owning-workflow key, or the recorded
/// workflow is no longer alive (terminal fork, finished job, or unknown id).
///
/// The age gate keeps sandboxes that are mid-creation (metadata not yet
/// persisted by the provider) from being flagged.
pub async fn find_orphaned_sandboxes(
    pool: &SqlitePool,
    provider: &dyn SandboxProvider,
    max_age_minutes: i64,
) -> anyhow::Result<Vec<String>> {
    let sandboxes = provider
        .list()
        .await
        .map_err(|e| anyhow::anyhow!("sandbox list failed: {e}"))?;
    let cutoff = Utc::now() - ChronoDuration::minutes(max_age_minutes);

    let mut orphaned = Vec::new();
    for sandbox in &sandboxes {
        if sandbox.started_at >= cutoff {
            continue;
        }
        let owned = match sandbox.metadata.get(WORKFLOW_ID_KEY) {
            None => false,
            Some(workflow_id) => workflow_is_live(pool, workflow_id).await?,
        };
        if !owned {
            info!(
                sandbox_id = %sandbox.sandbox_id,
                started_at = %sandbox.started_at,
                "orphaned sandbox found"
            );
            orphaned.push(sandbox.sandbox_id.clone());
        }
    }

    info!(
        total_sandboxes = sandboxes.len(),
        orphaned_count = orphaned.len(),
        "orphan scan completed"
    );

    Ok(orphaned)
}

/// Whether the workflow recorded on a sandbox is still alive: its fork has
/// not reached terminal state and its job is still in flight.
async fn workflow_is_live(pool: &SqlitePool, workflow_id: &str) -> anyhow::Result<bool> {
    let Some(fork) = forks_db::get_by_workflow_id(pool, workflow_id).await? else {
        return Ok(false);
    };
    if fork.status.is_terminal() {
        return Ok(false);
    }
    let Some(job) = jobs_db::get_job(pool, &fork.job_id).await? else {
        return Ok(false);
    };
    Ok(matches!(job.status, JobStatus::Queued | JobStatus::Running))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use hydra_db::models::NewJob;
    use hydra_db::queries::{forks, jobs};

    async fn test_ctx() -> (sqlx::SqlitePool, ActivityContext) {
        let pool = hydra_test_utils::create_test_pool().await;
        jobs::insert_job(
            &pool,
            &NewJob {
                id: "job".to_string(),
                task_queue: "q".to_string(),
                repo_url: "r".to_string(),
                branch: "main".to_string(),
                prompt: "p".to_string(),
                num_forks: 1,
                model: "sonnet".to_string(),
                max_concurrent: 1,
                fork_timeout_seconds: 60,
                budget_limit_usd: None,
                template: "base".to_string(),
                sandbox_timeout_seconds: 300,
            },
        )
        .await
        .unwrap();
        forks::get_or_create(&pool, "job", 1, "job-fork-1", "main")
            .await
            .unwrap();

        let ctx = ActivityContext::new(pool.clone(), "job", 1, "job-fork-1", "create-sandbox", 1);
        (pool, ctx)
    }

    #[tokio::test]
    async fn create_stamps_reserved_metadata() {
        let (pool, ctx) = test_ctx().await;
        let provider = MockProvider::new();

        let mut extra = HashMap::new();
        extra.insert("fork_num".to_string(), "1".to_string());

        let sandbox = create_sandbox(&provider, &ctx, "base", 300, None, extra)
            .await
            .unwrap();

        let metadata = provider.metadata_of(&sandbox.sandbox_id).unwrap();
        assert_eq!(metadata.get(WORKFLOW_ID_KEY).unwrap(), "job-fork-1");
        assert_eq!(
            metadata.get(ACTIVITY_ID_KEY).unwrap(),
            "job-fork-1:create-sandbox:1"
        );
        assert_eq!(metadata.get("fork_num").unwrap(), "1");

        // Heartbeats landed on the fork row.
        let fork = forks::get_fork(&pool, "job", 1).await.unwrap().unwrap();
        assert_eq!(fork.heartbeat_payload.as_deref(), Some("\"sandbox_verified\""));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_check_reports_unhealthy_without_raising() {
        let (pool, ctx) = test_ctx().await;
        let provider = MockProvider::new();
        let sandbox = create_sandbox(&provider, &ctx, "base", 300, None, HashMap::new())
            .await
            .unwrap();
        provider.mark_unhealthy(&sandbox.sandbox_id);

        let result = health_check(&provider, &sandbox.sandbox_id).await;
        assert!(!result.is_healthy);
        assert!(result.is_running);
        assert!(result.error.is_some());

        // A missing sandbox is also just an unhealthy result.
        let result = health_check(&provider, "no-such-sandbox").await;
        assert!(!result.is_healthy);
        assert!(!result.is_running);

        pool.close().await;
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let (pool, ctx) = test_ctx().await;
        let provider = MockProvider::new();
        let sandbox = create_sandbox(&provider, &ctx, "base", 300, None, HashMap::new())
            .await
            .unwrap();

        assert!(kill_sandbox(&provider, &sandbox.sandbox_id).await.unwrap());
        assert!(kill_sandbox(&provider, &sandbox.sandbox_id).await.unwrap());
        assert!(kill_sandbox(&provider, "never-existed").await.unwrap());

        pool.close().await;
    }

    #[tokio::test]
    async fn orphan_scan_is_age_gated_and_ownership_gated() {
        let (pool, _ctx) = test_ctx().await;
        let provider = MockProvider::new();
        let old = Utc::now() - ChronoDuration::minutes(200);

        // Old and untagged: orphan.
        provider.seed_sandbox("sbx-orphan", old, HashMap::new());
        // Old but owned by a live workflow (the seeded pending fork): kept.
        let mut live = HashMap::new();
        live.insert(WORKFLOW_ID_KEY.to_string(), "job-fork-1".to_string());
        provider.seed_sandbox("sbx-owned", old, live);
        // Old and tagged, but the workflow id is unknown: orphan.
        let mut dead = HashMap::new();
        dead.insert(WORKFLOW_ID_KEY.to_string(), "long-gone-wf".to_string());
        provider.seed_sandbox("sbx-dangling", old, dead);
        // Untagged but fresh: the age gate protects it.
        provider.seed_sandbox("sbx-fresh", Utc::now(), HashMap::new());

        let mut orphans = find_orphaned_sandboxes(&pool, &provider, 180).await.unwrap();
        orphans.sort();
        assert_eq!(
            orphans,
            vec!["sbx-dangling".to_string(), "sbx-orphan".to_string()]
        );

        pool.close().await;
    }
}

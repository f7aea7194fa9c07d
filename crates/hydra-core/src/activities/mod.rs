//! Activities: the retryable, side-effecting units invoked from workflows.
//!
//! Each activity is a short async function over the provider and/or the
//! store. Heartbeats are rows stamped on the owning fork, so liveness is
//! visible to `hydra status` and to worker-restart recovery.

pub mod agent;
pub mod observability;
pub mod sandbox;

use sqlx::SqlitePool;
use tracing::warn;

use hydra_db::queries::forks;

/// Per-invocation activity context: identifies the owning workflow and the
/// fork whose row receives heartbeats.
#[derive(Clone)]
pub struct ActivityContext {
    pub pool: SqlitePool,
    pub job_id: String,
    pub fork_num: i64,
    pub workflow_id: String,
    pub activity_id: String,
}

impl ActivityContext {
    /// Build a context for one scheduled activity attempt.
    pub fn new(
        pool: SqlitePool,
        job_id: impl Into<String>,
        fork_num: i64,
        workflow_id: impl Into<String>,
        activity: &str,
        attempt: u32,
    ) -> Self {
        let workflow_id = workflow_id.into();
        let activity_id = format!("{workflow_id}:{activity}:{attempt}");
        Self {
            pool,
            job_id: job_id.into(),
            fork_num,
            workflow_id,
            activity_id,
        }
    }

    /// Record a heartbeat for the owning fork. Best-effort: heartbeat
    /// persistence failures never fail the activity.
    pub async fn heartbeat(&self, payload: &serde_json::Value) {
        let rendered = payload.to_string();
        if let Err(e) =
            forks::record_heartbeat(&self.pool, &self.job_id, self.fork_num, &rendered).await
        {
            warn!(
                workflow_id = %self.workflow_id,
                error = %e,
                "failed to persist heartbeat"
            );
        }
    }
}

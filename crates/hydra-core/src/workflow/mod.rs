//! The three durable workflows: orchestration, fork, and janitor.
//!
//! Workflows are step-checkpointed async functions over the store: every
//! decision that must survive a crash is a row write, and every suspension
//! point (slot wait, pause wait, activity call) re-reads the flags that
//! signals set.

pub mod fork;
pub mod janitor;
pub mod orchestrator;

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Timeouts and retry policies for a single fork. Defaults carry the
/// production values; tests compress them.
#[derive(Debug, Clone)]
pub struct ForkSettings {
    /// Sandbox creation: per-attempt cap and retry policy.
    pub create_timeout: Duration,
    pub create_retry: RetryPolicy,
    /// Health check: single attempt with a hard cap.
    pub health_timeout: Duration,
    /// Agent run retry policy; the per-attempt cap is the job's
    /// `fork_timeout_seconds`.
    pub agent_retry: RetryPolicy,
    /// Interval of the agent activity's background heartbeat.
    pub heartbeat_interval: Duration,
    /// A running fork whose heartbeat is older than this is considered
    /// interrupted and is resumed by worker recovery.
    pub heartbeat_timeout: Duration,
    /// Sandbox kill: per-attempt cap and retry policy.
    pub cleanup_timeout: Duration,
    pub cleanup_retry: RetryPolicy,
    /// Ledger reads/writes.
    pub spend_timeout: Duration,
}

impl Default for ForkSettings {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(300),
            create_retry: RetryPolicy::new(3, Duration::from_secs(5), 2.0),
            health_timeout: Duration::from_secs(60),
            agent_retry: RetryPolicy::new(2, Duration::from_secs(10), 2.0),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(300),
            cleanup_timeout: Duration::from_secs(120),
            cleanup_retry: RetryPolicy::new(3, Duration::from_secs(2), 2.0),
            spend_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings of the orchestration workflow.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub fork: ForkSettings,
    /// Child-level retry for a fork whose run fails with an infrastructure
    /// error (as opposed to reaching a terminal status).
    pub child_retry: RetryPolicy,
    /// Headroom added to `fork_timeout_seconds` for the fork's execution
    /// timeout (covers sandbox setup and teardown).
    pub execution_headroom: Duration,
    /// Cap on the metrics-recording activity.
    pub metrics_timeout: Duration,
    /// How often pause/cancel flags and slot availability are re-read.
    pub poll_interval: Duration,
    /// Drain window for in-flight forks on worker shutdown.
    pub drain_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorSettings {
    pub fn new() -> Self {
        Self {
            fork: ForkSettings::default(),
            child_retry: RetryPolicy::new(2, Duration::from_secs(10), 2.0),
            execution_headroom: Duration::from_secs(300),
            metrics_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Branch a fork works on: unchanged for a single fork, suffixed with the
/// fork number otherwise.
pub fn fork_branch(branch: &str, fork_num: i64, num_forks: i64) -> String {
    if num_forks > 1 {
        format!("{branch}-{fork_num}")
    } else {
        branch.to_string()
    }
}

/// Workflow id of a fork child.
pub fn fork_workflow_id(job_id: &str, fork_num: i64) -> String {
    format!("{job_id}-fork-{fork_num}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fork_keeps_branch_unchanged() {
        assert_eq!(fork_branch("main", 1, 1), "main");
    }

    #[test]
    fn multiple_forks_get_numbered_branches() {
        assert_eq!(fork_branch("main", 1, 3), "main-1");
        assert_eq!(fork_branch("main", 3, 3), "main-3");
    }

    #[test]
    fn fork_workflow_ids_nest_under_the_job() {
        assert_eq!(fork_workflow_id("sandbox-orch-ab12", 2), "sandbox-orch-ab12-fork-2");
    }

    #[test]
    fn default_settings_carry_production_values() {
        let settings = OrchestratorSettings::new();
        assert_eq!(settings.fork.create_retry.maximum_attempts, 3);
        assert_eq!(settings.fork.agent_retry.maximum_attempts, 2);
        assert_eq!(settings.fork.cleanup_retry.maximum_attempts, 3);
        assert_eq!(settings.execution_headroom, Duration::from_secs(300));
    }
}

//! The `SandboxProvider` trait -- the seam between the orchestrator and the
//! external sandbox provider SDK.
//!
//! The trait covers exactly the provider surface the workflows need: create,
//! run-command (connect + exec), kill, list, is-running. Real provider SDKs
//! implement this out of tree; [`mock::MockProvider`] ships in-tree for
//! development and tests.

pub mod mock;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Reserved metadata key: the id of the workflow that owns the sandbox.
///
/// Absence of this key on an aged sandbox is the janitor's orphan signal.
pub const WORKFLOW_ID_KEY: &str = "workflow_id";

/// Reserved metadata key: the id of the activity that created the sandbox.
pub const ACTIVITY_ID_KEY: &str = "activity_id";

/// Metadata key carrying the fork number.
pub const FORK_NUM_KEY: &str = "fork_num";

/// Request to provision a sandbox.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub template: String,
    pub timeout_seconds: i64,
    pub envs: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// A provisioned sandbox as the provider reports it.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template_id: String,
    pub started_at: DateTime<Utc>,
    pub hostname: Option<String>,
    pub is_running: bool,
    pub metadata: HashMap<String, String>,
}

/// A command to execute inside a sandbox.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub timeout: Duration,
    pub envs: HashMap<String, String>,
}

impl CommandRequest {
    /// A bare command with a timeout and no cwd/env overrides.
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout,
            envs: HashMap::new(),
        }
    }
}

/// Output of a sandbox command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Provider errors, classified for retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Structural creation failure; retrying will not help.
    #[error("sandbox creation failed: {0}")]
    Creation(String),

    /// The sandbox does not exist (or is already dead).
    #[error("sandbox {0} not found")]
    NotFound(String),

    /// The command hit the provider-side execution timeout.
    #[error("command timed out after {timeout:?} in sandbox {sandbox_id}")]
    CommandTimeout {
        sandbox_id: String,
        timeout: Duration,
    },

    /// The command could not be executed.
    #[error("command failed in sandbox {sandbox_id}: {message}")]
    Command { sandbox_id: String, message: String },

    /// Transient transport failure (network, provider 5xx).
    #[error("provider transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether the default retry policy should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Blocking-style client for the sandbox provider, wrapped for async use.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a sandbox from a template.
    async fn create(&self, request: &CreateRequest) -> Result<SandboxInfo, ProviderError>;

    /// Execute a command inside a running sandbox.
    async fn run_command(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandOutput, ProviderError>;

    /// Kill a sandbox. Returns [`ProviderError::NotFound`] when it is
    /// already gone.
    async fn kill(&self, sandbox_id: &str) -> Result<(), ProviderError>;

    /// List all sandboxes visible to this account.
    async fn list(&self) -> Result<Vec<SandboxInfo>, ProviderError>;

    /// Whether a sandbox is currently running.
    async fn is_running(&self, sandbox_id: &str) -> Result<bool, ProviderError>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn SandboxProvider) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(ProviderError::Transport("502".into()).is_retryable());
        assert!(!ProviderError::Creation("bad template".into()).is_retryable());
        assert!(!ProviderError::NotFound("sbx".into()).is_retryable());
        assert!(
            !ProviderError::CommandTimeout {
                sandbox_id: "sbx".into(),
                timeout: Duration::from_secs(1),
            }
            .is_retryable()
        );
    }
}

//! In-memory sandbox provider for development and tests.
//!
//! Behavior is scriptable: creation can be made to fail N times, specific
//! sandboxes can be marked unhealthy, and command responses are matched by
//! substring. The provider also keeps a high-water mark of concurrently
//! alive sandboxes so tests can assert concurrency caps.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CommandOutput, CommandRequest, CreateRequest, ProviderError, SandboxInfo, SandboxProvider,
};

/// A scripted response for commands containing a substring.
#[derive(Debug, Clone)]
pub struct CommandRule {
    /// Substring matched against the incoming command.
    pub needle: String,
    /// Simulated execution time. When it exceeds the request timeout the
    /// command fails with [`ProviderError::CommandTimeout`].
    pub delay: Duration,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandRule {
    /// A rule that succeeds immediately with the given stdout.
    pub fn ok(needle: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            delay: Duration::ZERO,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A rule that fails with the given exit code and stderr.
    pub fn fail(needle: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            delay: Duration::ZERO,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Add a simulated execution delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug)]
struct MockSandbox {
    info: SandboxInfo,
    alive: bool,
}

#[derive(Debug, Default)]
struct MockState {
    sandboxes: HashMap<String, MockSandbox>,
    rules: Vec<CommandRule>,
    next_id: u64,
    create_failures: u32,
    create_transport_failures: u32,
    unhealthy: Vec<String>,
    killed: Vec<String>,
    created: u64,
    alive_now: u64,
    max_alive: u64,
}

/// Scriptable in-memory provider.
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` creations with a structural creation error.
    pub fn fail_next_creates(&self, n: u32) {
        self.lock().create_failures = n;
    }

    /// Fail the next `n` creations with a transient transport error.
    pub fn fail_next_creates_transient(&self, n: u32) {
        self.lock().create_transport_failures = n;
    }

    /// Mark a sandbox id (assigned in creation order: `sbx-1`, `sbx-2`, ...)
    /// as unhealthy: its health-check command exits non-zero.
    pub fn mark_unhealthy(&self, sandbox_id: impl Into<String>) {
        self.lock().unhealthy.push(sandbox_id.into());
    }

    /// Append a command rule. Rules are matched in insertion order; the
    /// first needle contained in the command wins. Unmatched commands
    /// succeed with empty output.
    pub fn add_rule(&self, rule: CommandRule) {
        self.lock().rules.push(rule);
    }

    /// Insert a pre-existing sandbox, e.g. an orphan for janitor tests.
    pub fn seed_sandbox(
        &self,
        sandbox_id: impl Into<String>,
        started_at: DateTime<Utc>,
        metadata: HashMap<String, String>,
    ) {
        let sandbox_id = sandbox_id.into();
        let mut state = self.lock();
        state.sandboxes.insert(
            sandbox_id.clone(),
            MockSandbox {
                info: SandboxInfo {
                    sandbox_id,
                    template_id: "base".to_string(),
                    started_at,
                    hostname: None,
                    is_running: true,
                    metadata,
                },
                alive: true,
            },
        );
        state.alive_now += 1;
        state.max_alive = state.max_alive.max(state.alive_now);
    }

    /// Total sandboxes created through `create`.
    pub fn created_count(&self) -> u64 {
        self.lock().created
    }

    /// Ids killed so far, in kill order (successful kills only).
    pub fn killed_ids(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    /// High-water mark of concurrently alive sandboxes.
    pub fn max_alive(&self) -> u64 {
        self.lock().max_alive
    }

    /// Number of sandboxes currently alive.
    pub fn alive_count(&self) -> u64 {
        self.lock().alive_now
    }

    /// Metadata of a sandbox, if it exists.
    pub fn metadata_of(&self, sandbox_id: &str) -> Option<HashMap<String, String>> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.info.metadata.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn create(&self, request: &CreateRequest) -> Result<SandboxInfo, ProviderError> {
        let info = {
            let mut state = self.lock();

            if state.create_failures > 0 {
                state.create_failures -= 1;
                return Err(ProviderError::Creation("template rejected".to_string()));
            }
            if state.create_transport_failures > 0 {
                state.create_transport_failures -= 1;
                return Err(ProviderError::Transport("connection reset".to_string()));
            }

            state.next_id += 1;
            state.created += 1;
            let sandbox_id = format!("sbx-{}", state.next_id);

            let info = SandboxInfo {
                sandbox_id: sandbox_id.clone(),
                template_id: request.template.clone(),
                started_at: Utc::now(),
                hostname: Some(format!("{sandbox_id}.mock.internal")),
                is_running: true,
                metadata: request.metadata.clone(),
            };

            state.sandboxes.insert(
                sandbox_id,
                MockSandbox {
                    info: info.clone(),
                    alive: true,
                },
            );
            state.alive_now += 1;
            state.max_alive = state.max_alive.max(state.alive_now);
            info
        };

        Ok(info)
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandOutput, ProviderError> {
        let rule = {
            let state = self.lock();
            let sandbox = state
                .sandboxes
                .get(sandbox_id)
                .ok_or_else(|| ProviderError::NotFound(sandbox_id.to_string()))?;
            if !sandbox.alive {
                return Err(ProviderError::NotFound(sandbox_id.to_string()));
            }

            // Unhealthy sandboxes fail their health probe.
            if request.command.contains("health_check")
                && state.unhealthy.iter().any(|id| id == sandbox_id)
            {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: "sandbox unresponsive".to_string(),
                    exit_code: 1,
                });
            }

            state
                .rules
                .iter()
                .find(|r| request.command.contains(&r.needle))
                .cloned()
        };

        let Some(rule) = rule else {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            });
        };

        if rule.delay >= request.timeout {
            tokio::time::sleep(request.timeout).await;
            return Err(ProviderError::CommandTimeout {
                sandbox_id: sandbox_id.to_string(),
                timeout: request.timeout,
            });
        }
        if !rule.delay.is_zero() {
            tokio::time::sleep(rule.delay).await;
        }

        Ok(CommandOutput {
            stdout: rule.stdout,
            stderr: rule.stderr,
            exit_code: rule.exit_code,
        })
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        match state.sandboxes.get_mut(sandbox_id) {
            Some(sandbox) if sandbox.alive => {
                sandbox.alive = false;
                sandbox.info.is_running = false;
                state.alive_now -= 1;
                state.killed.push(sandbox_id.to_string());
                Ok(())
            }
            _ => Err(ProviderError::NotFound(sandbox_id.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>, ProviderError> {
        let state = self.lock();
        Ok(state
            .sandboxes
            .values()
            .filter(|s| s.alive)
            .map(|s| s.info.clone())
            .collect())
    }

    async fn is_running(&self, sandbox_id: &str) -> Result<bool, ProviderError> {
        let state = self.lock();
        Ok(state
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.alive)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request() -> CreateRequest {
        CreateRequest {
            template: "base".to_string(),
            timeout_seconds: 300,
            envs: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_kill_lifecycle() {
        let provider = MockProvider::new();

        let info = provider.create(&create_request()).await.unwrap();
        assert_eq!(info.sandbox_id, "sbx-1");
        assert!(provider.is_running("sbx-1").await.unwrap());
        assert_eq!(provider.alive_count(), 1);

        provider.kill("sbx-1").await.unwrap();
        assert!(!provider.is_running("sbx-1").await.unwrap());
        assert_eq!(provider.alive_count(), 0);
        assert_eq!(provider.killed_ids(), vec!["sbx-1".to_string()]);

        // Killing again reports not-found: at most one successful kill.
        assert!(matches!(
            provider.kill("sbx-1").await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(provider.killed_ids().len(), 1);
    }

    #[tokio::test]
    async fn scripted_create_failures() {
        let provider = MockProvider::new();
        provider.fail_next_creates(1);
        provider.fail_next_creates_transient(0);

        assert!(matches!(
            provider.create(&create_request()).await,
            Err(ProviderError::Creation(_))
        ));
        assert!(provider.create(&create_request()).await.is_ok());
    }

    #[tokio::test]
    async fn command_rules_match_by_substring() {
        let provider = MockProvider::new();
        provider.create(&create_request()).await.unwrap();
        provider.add_rule(CommandRule::ok("git clone", "Cloning..."));
        provider.add_rule(CommandRule::fail("claude", 1, "boom"));

        let out = provider
            .run_command(
                "sbx-1",
                &CommandRequest::new("git clone https://x /workspace", Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "Cloning...");

        let out = provider
            .run_command(
                "sbx-1",
                &CommandRequest::new("echo p | claude -p", Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.stderr, "boom");

        // Unmatched commands succeed with empty output.
        let out = provider
            .run_command("sbx-1", &CommandRequest::new("ls", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn slow_rule_times_out() {
        let provider = MockProvider::new();
        provider.create(&create_request()).await.unwrap();
        provider.add_rule(CommandRule::ok("sleep", "").with_delay(Duration::from_secs(60)));

        let err = provider
            .run_command(
                "sbx-1",
                &CommandRequest::new("sleep 120", Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn max_alive_tracks_high_water_mark() {
        let provider = MockProvider::new();
        provider.create(&create_request()).await.unwrap();
        provider.create(&create_request()).await.unwrap();
        provider.kill("sbx-1").await.unwrap();
        provider.create(&create_request()).await.unwrap();

        assert_eq!(provider.max_alive(), 2);
        assert_eq!(provider.alive_count(), 2);
    }

    #[tokio::test]
    async fn unhealthy_sandbox_fails_health_probe_only() {
        let provider = MockProvider::new();
        provider.create(&create_request()).await.unwrap();
        provider.mark_unhealthy("sbx-1");

        let out = provider
            .run_command(
                "sbx-1",
                &CommandRequest::new("echo health_check", Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);

        let out = provider
            .run_command("sbx-1", &CommandRequest::new("ls", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
    }
}

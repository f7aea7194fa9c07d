use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an orchestration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

/// Terminal and in-flight statuses of a single fork.
///
/// Everything except `Pending` and `Running` is terminal; a fork reaches a
/// terminal status at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ForkStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    BudgetExceeded,
}

impl ForkStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ForkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::BudgetExceeded => "budget_exceeded",
        };
        f.write_str(s)
    }
}

impl FromStr for ForkStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "budget_exceeded" => Ok(Self::BudgetExceeded),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

/// The step a fork is currently executing.
///
/// Persisted before the step runs, so a restarted worker re-enters the fork
/// at exactly this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ForkStep {
    Admission,
    CreateSandbox,
    HealthCheck,
    RunAgent,
    Cleanup,
    Done,
}

impl fmt::Display for ForkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Admission => "admission",
            Self::CreateSandbox => "create_sandbox",
            Self::HealthCheck => "health_check",
            Self::RunAgent => "run_agent",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError(pub String);

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status: {:?}", self.0)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// An orchestration job: one `hydra fork` submission.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: String,
    pub task_queue: String,
    pub status: JobStatus,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub num_forks: i64,
    pub model: String,
    pub max_concurrent: i64,
    pub fork_timeout_seconds: i64,
    pub budget_limit_usd: Option<f64>,
    pub template: String,
    pub sandbox_timeout_seconds: i64,
    pub paused: bool,
    pub cancelled: bool,
    pub successful: i64,
    pub failed_forks: i64,
    pub total_cost_usd: f64,
    pub total_duration_seconds: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields required to submit a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub task_queue: String,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub num_forks: i64,
    pub model: String,
    pub max_concurrent: i64,
    pub fork_timeout_seconds: i64,
    pub budget_limit_usd: Option<f64>,
    pub template: String,
    pub sandbox_timeout_seconds: i64,
}

/// One fork of a job.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Fork {
    pub job_id: String,
    pub fork_num: i64,
    pub workflow_id: String,
    pub fork_branch: String,
    pub status: ForkStatus,
    pub step: ForkStep,
    pub attempt: i64,
    pub cancel_requested: bool,
    pub sandbox_id: Option<String>,
    pub cost_usd: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_seconds: f64,
    pub output: Option<String>,
    pub error: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_payload: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal outcome of a fork, written exactly once.
#[derive(Debug, Clone)]
pub struct ForkTerminal {
    pub status: ForkStatus,
    pub cost_usd: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_seconds: f64,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Aggregate progress of a job, derived from its fork rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub in_progress: i64,
    pub total_cost_usd: f64,
    pub paused: bool,
    pub cancelled: bool,
}

/// Singleton state of the orphaned-sandbox janitor.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JanitorState {
    pub interval_minutes: i64,
    pub max_age_minutes: i64,
    pub running: bool,
    pub stop_requested: bool,
    pub total_cleaned: i64,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

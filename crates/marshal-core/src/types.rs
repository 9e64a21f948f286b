use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Status enums ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    NeedsClarification,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NeedsClarification => "needs_clarification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "needs_clarification" => Some(Self::NeedsClarification),
            _ => None,
        }
    }
}

/// Internal pipeline-execution state machine:
/// `pending → running → {success, failed, canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Idle,
    Processing,
    Completed,
}

impl LockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

// ── Domain records ───────────────────────────────────────────────────────

/// A unit of work created for one claimed issue.
/// Never re-created for the same issue; dedup is enforced via the lock
/// record, not a uniqueness constraint here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: Option<i64>,
    pub task_source_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// One agent invocation for a task. Immutable after creation; its history
/// lives in the session's messages and pipeline executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub task_id: i64,
    /// Opaque runner identifier chosen by the round-robin selector.
    pub runner: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only log entry, one row per agent progress chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: i64,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One externally-triggered CI pipeline run for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: i64,
    pub session_id: i64,
    pub worker_repository_id: i64,
    /// External pipeline handle. Empty until the trigger call succeeds.
    pub pipeline_id: String,
    pub status: PipelineStatus,
    /// Refreshed on every reconciliation, even when the status is
    /// unchanged. Staleness is measured against this, not against status
    /// transitions.
    pub last_status_update: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
}

/// A repository an issue's workspace is prepared from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoTarget {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub clone_url: String,
}

/// The CI-hosting registration backing pipeline execution for a project:
/// remote project, credentials, and the current CI file version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRepository {
    pub id: i64,
    pub project_id: i64,
    pub remote_project_id: String,
    pub host: String,
    pub encrypted_token: String,
    pub ci_version: String,
    pub pipeline_ref: String,
}

/// The persisted lock/completion state for one (issue, scope) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub issue_id: String,
    pub scope_id: i64,
    pub status: LockStatus,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub result_task_id: Option<i64>,
    pub lock_holder_id: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
}

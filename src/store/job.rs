use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Ready to be claimed (or waiting out a retry backoff).
    Waiting,
    /// Taken by `take_next` but not yet durably marked running.
    Claimed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Claimed => write!(f, "claimed"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work submitted for distributed execution.
///
/// State transitions are monotonic except for explicit retry, which moves
/// a running job back to waiting with `retry_count + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    /// Opaque parameters; the scheduler never looks inside.
    pub payload: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
    pub state: JobState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_worker: Option<u64>,
    /// Earliest time the job may be claimed again; set by retry backoff.
    pub not_before: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_type: String, payload: Vec<u8>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            submitted_at: Utc::now(),
            state: JobState::Waiting,
            retry_count: 0,
            max_retries,
            assigned_worker: None,
            not_before: None,
        }
    }

    pub fn ready_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultAction {
    ExecuteSuccess,
    ExecuteFailed,
    ExecuteLater,
    ExecuteException,
}

/// Outcome of one execution attempt, produced by the worker and consumed
/// exactly once by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub action: ResultAction,
    pub message: String,
    /// Worker-supplied delay hint, honored for `ExecuteLater`.
    pub backoff_hint_ms: Option<u64>,
}

impl JobResult {
    pub fn success(message: String) -> Self {
        Self {
            action: ResultAction::ExecuteSuccess,
            message,
            backoff_hint_ms: None,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            action: ResultAction::ExecuteFailed,
            message,
            backoff_hint_ms: None,
        }
    }

    pub fn later(backoff_hint_ms: Option<u64>) -> Self {
        Self {
            action: ResultAction::ExecuteLater,
            message: "worker requested deferred retry".to_string(),
            backoff_hint_ms,
        }
    }

    pub fn exception(message: String) -> Self {
        Self {
            action: ResultAction::ExecuteException,
            message,
            backoff_hint_ms: None,
        }
    }
}

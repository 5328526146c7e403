//! Task types and the handler seam workers execute through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::worker::worker::WorkerContext;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue (initially or for a retry).
    Queued,
    /// Held by an active worker session.
    Assigned,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Why an attempt did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Task logic fault.
    Execution,
    /// Worker exceeded its memory or runtime budget.
    ResourceExhausted,
    /// No heartbeat within the supervisor's timeout.
    TimedOut,
    /// Explicit cancellation.
    Cancelled,
    /// Worker exited without reporting a result.
    Lost,
}

impl FailureKind {
    /// Cancellation is final; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Execution => "execution",
            Self::ResourceExhausted => "resource_exhausted",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Lost => "lost",
        };
        write!(f, "{s}")
    }
}

/// One failed attempt in a task's retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number that failed.
    pub attempt: u32,
    /// Worker session that ran the attempt.
    pub session_id: Uuid,
    pub kind: FailureKind,
    /// Error text reported by the worker or the supervisor.
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Output of a successful task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: serde_json::Value,
    /// Short text appended to the task's context on completion.
    pub summary: Option<String>,
    /// Wall time of the handler, filled in by the worker.
    pub duration_ms: u64,
}

impl TaskOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            summary: None,
            duration_ms: 0,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// A unit of work submitted to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Opaque to the scheduler; interpreted by the task handler.
    pub payload: serde_json::Value,
    /// Higher runs first.
    pub priority: i32,
    /// Retries consumed so far.
    pub retries: u32,
    /// Retries allowed; `None` takes the supervisor's configured default.
    pub max_retries: Option<u32>,
    pub status: TaskStatus,
    /// Context the worker's snapshot is drawn from.
    pub context_id: Option<Uuid>,
    /// Snapshot token budget override.
    pub context_budget: Option<usize>,
    pub result: Option<TaskOutput>,
    pub error: Option<String>,
    pub history: Vec<Attempt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            priority: 0,
            retries: 0,
            max_retries: None,
            status: TaskStatus::Queued,
            context_id: None,
            context_budget: None,
            result: None,
            error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_context(mut self, context_id: Uuid) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_context_budget(mut self, tokens: usize) -> Self {
        self.context_budget = Some(tokens);
        self
    }

    /// Attempt number of the next (or current) run, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    pub fn retries_remaining(&self) -> bool {
        self.retries < self.max_retries.unwrap_or(0)
    }

    /// Caller-facing view of a finished (or in-flight) task.
    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            task_id: self.id,
            status: self.status,
            output: self.result.clone(),
            error: self.error.clone(),
            retries: self.retries,
            history: self.history.clone(),
        }
    }
}

/// What a caller waiting on a task receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    /// `Completed` or `Failed`.
    pub status: TaskStatus,
    /// Handler output; set only when the task completed.
    pub output: Option<TaskOutput>,
    /// Last failure message when the task failed.
    pub error: Option<String>,
    /// Retries consumed before the final attempt.
    pub retries: u32,
    /// Every failed attempt, oldest first.
    pub history: Vec<Attempt>,
}

/// Executes task payloads inside a worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        ctx: &WorkerContext,
        payload: serde_json::Value,
    ) -> Result<TaskOutput, WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_cancellation_is_final() {
        assert!(FailureKind::Execution.is_retryable());
        assert!(FailureKind::ResourceExhausted.is_retryable());
        assert!(FailureKind::TimedOut.is_retryable());
        assert!(FailureKind::Lost.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }

    #[test]
    fn retries_remaining_uses_max() {
        let mut task = Task::new(serde_json::json!({})).with_max_retries(2);
        assert!(task.retries_remaining());
        task.retries = 2;
        assert!(!task.retries_remaining());
        assert_eq!(task.attempt(), 3);
    }

    #[test]
    fn unresolved_max_retries_means_none() {
        let task = Task::new(serde_json::json!({}));
        assert!(!task.retries_remaining());
    }
}

//! `Database` trait: single async interface for all persistence.
//!
//! The supervisor is the only writer of task and session rows; the context
//! manager owns the context segment rows.

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::{ContextSegment, Tier};
use crate::error::DatabaseError;
use crate::worker::{SessionState, Task, TaskStatus, WorkerSession};

/// Backend-agnostic database trait covering tasks, sessions and context.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a newly enqueued task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Overwrite a task's mutable fields (status, retries, result, history).
    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Tasks in a given status, highest priority first, oldest first within a priority.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert a newly spawned session.
    async fn insert_session(&self, session: &WorkerSession) -> Result<(), DatabaseError>;

    /// Overwrite a session's state, heartbeat, memory and end time.
    async fn update_session(&self, session: &WorkerSession) -> Result<(), DatabaseError>;

    /// Get a session by ID.
    async fn get_session(&self, id: Uuid) -> Result<Option<WorkerSession>, DatabaseError>;

    /// All sessions that ran a task, in attempt order.
    async fn list_sessions_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<WorkerSession>, DatabaseError>;

    /// Sessions whose state is not `terminated`.
    async fn list_open_sessions(&self) -> Result<Vec<WorkerSession>, DatabaseError>;

    /// Count of sessions in a given state.
    async fn count_sessions_in_state(&self, state: SessionState) -> Result<i64, DatabaseError>;

    // ── Context segments ────────────────────────────────────────────

    /// Append a single segment.
    async fn insert_context_segment(
        &self,
        context_id: Uuid,
        segment: &ContextSegment,
    ) -> Result<(), DatabaseError>;

    /// Atomically replace every segment of one tier.
    async fn replace_context_tier(
        &self,
        context_id: Uuid,
        tier: Tier,
        segments: &[ContextSegment],
    ) -> Result<(), DatabaseError>;

    /// Segments of a context, optionally limited to one tier, ordered by tier then seq.
    async fn list_context_segments(
        &self,
        context_id: Uuid,
        tier: Option<Tier>,
    ) -> Result<Vec<ContextSegment>, DatabaseError>;

    /// Delete a context. Returns the number of segments removed.
    async fn delete_context(&self, context_id: Uuid) -> Result<usize, DatabaseError>;
}

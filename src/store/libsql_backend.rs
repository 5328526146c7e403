//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::{ContextSegment, Tier};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::worker::{SessionState, Task, TaskStatus, WorkerSession};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const TASK_COLUMNS: &str = "id, payload, status, priority, retries, max_retries, context_id, context_budget, result, error, history, created_at, updated_at";

const SESSION_COLUMNS: &str =
    "id, task_id, attempt, state, started_at, ended_at, peak_memory, last_heartbeat, reason";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let payload_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.payload: {e}")))?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.payload: {e}")))?;

    let status_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status: TaskStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    let priority: i64 = row.get(3).unwrap_or(0);
    let retries: i64 = row.get(4).unwrap_or(0);
    let max_retries: Option<i64> = row.get(5).ok();

    let context_id = row
        .get::<String>(6)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| parse_uuid(&s, "task.context_id"))
        .transpose()?;
    let context_budget: Option<i64> = row.get(7).ok();

    let result = row
        .get::<String>(8)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("task.result: {e}")))?;
    let error: Option<String> = row.get(9).ok();

    let history_str: String = row.get(10).unwrap_or_else(|_| "[]".to_string());
    let history = serde_json::from_str(&history_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.history: {e}")))?;

    let created_at: String = row.get(11).unwrap_or_default();
    let updated_at: String = row.get(12).unwrap_or_default();

    Ok(Task {
        id: parse_uuid(&id_str, "task.id")?,
        payload,
        priority: priority as i32,
        retries: retries as u32,
        max_retries: max_retries.map(|v| v as u32),
        status,
        context_id,
        context_budget: context_budget.map(|v| v as usize),
        result,
        error,
        history,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_session(row: &libsql::Row) -> Result<WorkerSession, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("session.id: {e}")))?;
    let task_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("session.task_id: {e}")))?;
    let attempt: i64 = row.get(2).unwrap_or(1);
    let state_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("session.state: {e}")))?;
    let state: SessionState = state_str.parse().map_err(DatabaseError::Serialization)?;
    let started_at: String = row.get(4).unwrap_or_default();
    let peak_memory: i64 = row.get(6).unwrap_or(0);

    Ok(WorkerSession {
        id: parse_uuid(&id_str, "session.id")?,
        task_id: parse_uuid(&task_str, "session.task_id")?,
        attempt: attempt as u32,
        state,
        started_at: parse_datetime(&started_at),
        ended_at: parse_optional_datetime(row.get(5).ok()),
        peak_memory: peak_memory.max(0) as u64,
        last_heartbeat: parse_optional_datetime(row.get(7).ok()),
        reason: row.get(8).ok(),
        transitions: Vec::new(),
    })
}

fn row_to_segment(row: &libsql::Row) -> Result<ContextSegment, DatabaseError> {
    let tier_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("segment.tier: {e}")))?;
    let seq: i64 = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("segment.seq: {e}")))?;
    let tokens: i64 = row.get(2).unwrap_or(0);
    let content: String = row.get(3).unwrap_or_default();
    let created_at: String = row.get(4).unwrap_or_default();

    Ok(ContextSegment {
        tier: tier_str.parse::<Tier>().map_err(DatabaseError::Serialization)?,
        seq: seq as u64,
        tokens: tokens as usize,
        content,
        created_at: parse_datetime(&created_at),
    })
}

async fn collect_sessions(mut rows: libsql::Rows) -> Result<Vec<WorkerSession>, DatabaseError> {
    let mut sessions = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        sessions.push(row_to_session(&row)?);
    }
    Ok(sessions)
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let result_json = task.result.as_ref().map(to_json).transpose()?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    task.id.to_string(),
                    to_json(&task.payload)?,
                    task.status.as_str(),
                    task.priority as i64,
                    task.retries as i64,
                    task.max_retries.map(|v| v as i64),
                    task.context_id.map(|id| id.to_string()),
                    task.context_budget.map(|v| v as i64),
                    result_json,
                    task.error.clone(),
                    to_json(&task.history)?,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(task_id = %task.id, "Task inserted");
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let result_json = task.result.as_ref().map(to_json).transpose()?;
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, priority = ?2, retries = ?3, max_retries = ?4,
                     result = ?5, error = ?6, history = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    task.status.as_str(),
                    task.priority as i64,
                    task.retries as i64,
                    task.max_retries.map(|v| v as i64),
                    result_json,
                    task.error.clone(),
                    to_json(&task.history)?,
                    task.updated_at.to_rfc3339(),
                    task.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                     ORDER BY priority DESC, created_at ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_status: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &WorkerSession) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO sessions ({SESSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    session.id.to_string(),
                    session.task_id.to_string(),
                    session.attempt as i64,
                    session.state.as_str(),
                    session.started_at.to_rfc3339(),
                    session.ended_at.map(|d| d.to_rfc3339()),
                    session.peak_memory as i64,
                    session.last_heartbeat.map(|d| d.to_rfc3339()),
                    session.reason.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_session: {e}")))?;
        debug!(session_id = %session.id, task_id = %session.task_id, "Session inserted");
        Ok(())
    }

    async fn update_session(&self, session: &WorkerSession) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET state = ?1, ended_at = ?2, peak_memory = ?3,
                     last_heartbeat = ?4, reason = ?5
                 WHERE id = ?6",
                params![
                    session.state.as_str(),
                    session.ended_at.map(|d| d.to_rfc3339()),
                    session.peak_memory as i64,
                    session.last_heartbeat.map(|d| d.to_rfc3339()),
                    session.reason.clone(),
                    session.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_session: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session".to_string(),
                id: session.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<WorkerSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session row: {e}"))),
        }
    }

    async fn list_sessions_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<WorkerSession>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE task_id = ?1
                     ORDER BY attempt ASC, started_at ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sessions_for_task: {e}")))?;
        collect_sessions(rows).await
    }

    async fn list_open_sessions(&self) -> Result<Vec<WorkerSession>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE state != 'terminated'
                     ORDER BY started_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_open_sessions: {e}")))?;
        collect_sessions(rows).await
    }

    async fn count_sessions_in_state(&self, state: SessionState) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM sessions WHERE state = ?1",
                params![state.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_sessions_in_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_sessions_in_state row: {e}"))),
        }
    }

    // ── Context segments ────────────────────────────────────────────

    async fn insert_context_segment(
        &self,
        context_id: Uuid,
        segment: &ContextSegment,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO context_segments (context_id, tier, seq, tokens, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    context_id.to_string(),
                    segment.tier.as_str(),
                    segment.seq as i64,
                    segment.tokens as i64,
                    segment.content.as_str(),
                    segment.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_context_segment: {e}")))?;
        Ok(())
    }

    async fn replace_context_tier(
        &self,
        context_id: Uuid,
        tier: Tier,
        segments: &[ContextSegment],
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_context_tier begin: {e}")))?;

        tx.execute(
            "DELETE FROM context_segments WHERE context_id = ?1 AND tier = ?2",
            params![context_id.to_string(), tier.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_context_tier delete: {e}")))?;

        for segment in segments {
            tx.execute(
                "INSERT INTO context_segments (context_id, tier, seq, tokens, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    context_id.to_string(),
                    tier.as_str(),
                    segment.seq as i64,
                    segment.tokens as i64,
                    segment.content.as_str(),
                    segment.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_context_tier insert: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_context_tier commit: {e}")))?;
        debug!(%context_id, %tier, count = segments.len(), "Context tier replaced");
        Ok(())
    }

    async fn list_context_segments(
        &self,
        context_id: Uuid,
        tier: Option<Tier>,
    ) -> Result<Vec<ContextSegment>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match tier {
            Some(tier) => conn
                .query(
                    "SELECT tier, seq, tokens, content, created_at FROM context_segments
                     WHERE context_id = ?1 AND tier = ?2 ORDER BY seq ASC",
                    params![context_id.to_string(), tier.as_str()],
                )
                .await,
            None => conn
                .query(
                    "SELECT tier, seq, tokens, content, created_at FROM context_segments
                     WHERE context_id = ?1 ORDER BY tier ASC, seq ASC",
                    params![context_id.to_string()],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_context_segments: {e}")))?;

        let mut segments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            segments.push(row_to_segment(&row)?);
        }
        Ok(segments)
    }

    async fn delete_context(&self, context_id: Uuid) -> Result<usize, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM context_segments WHERE context_id = ?1",
                params![context_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_context: {e}")))?;
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Attempt, FailureKind, TaskOutput};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = test_db().await;
        let context_id = Uuid::new_v4();
        let task = Task::new(serde_json::json!({"kind": "echo", "n": 1}))
            .with_priority(5)
            .with_max_retries(2)
            .with_context(context_id);

        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.payload, task.payload);
        assert_eq!(fetched.priority, 5);
        assert_eq!(fetched.max_retries, Some(2));
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.context_id, Some(context_id));
        assert!(fetched.result.is_none());
        assert!(fetched.history.is_empty());
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_task_persists_result_and_history() {
        let db = test_db().await;
        let mut task = Task::new(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();

        task.retries = 1;
        task.history.push(Attempt {
            attempt: 1,
            session_id: Uuid::new_v4(),
            kind: FailureKind::TimedOut,
            message: "no heartbeat".into(),
            at: Utc::now(),
        });
        task.status = TaskStatus::Completed;
        task.result = Some(TaskOutput::new(serde_json::json!({"lines": 3})).with_summary("3 lines"));
        db.update_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.retries, 1);
        assert_eq!(fetched.history, task.history);
        assert_eq!(fetched.result, task.result);
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_task(&Task::new(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_tasks_orders_by_priority() {
        let db = test_db().await;
        let low = Task::new(serde_json::json!({"n": "low"}));
        let high = Task::new(serde_json::json!({"n": "high"})).with_priority(9);
        let mut done = Task::new(serde_json::json!({"n": "done"}));
        done.status = TaskStatus::Completed;
        for task in [&low, &high, &done] {
            db.insert_task(task).await.unwrap();
        }

        let queued = db.list_tasks_by_status(TaskStatus::Queued).await.unwrap();
        let ids: Vec<_> = queued.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    // ── Session tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn session_lifecycle_roundtrip() {
        let db = test_db().await;
        let task = Task::new(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();

        let mut session = WorkerSession::new(task.id, 1);
        db.insert_session(&session).await.unwrap();
        assert_eq!(db.list_open_sessions().await.unwrap().len(), 1);

        session.transition_to(SessionState::Running, None).unwrap();
        session.observe_memory(4096);
        session.last_heartbeat = Some(Utc::now());
        session
            .transition_to(SessionState::Completed, Some("ok".into()))
            .unwrap();
        session.transition_to(SessionState::Terminated, None).unwrap();
        db.update_session(&session).await.unwrap();

        let fetched = db.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, SessionState::Terminated);
        assert_eq!(fetched.peak_memory, 4096);
        assert!(fetched.ended_at.is_some());
        assert!(fetched.last_heartbeat.is_some());
        assert_eq!(fetched.reason.as_deref(), Some("ok"));

        assert!(db.list_open_sessions().await.unwrap().is_empty());
        assert_eq!(
            db.count_sessions_in_state(SessionState::Terminated)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn sessions_for_task_in_attempt_order() {
        let db = test_db().await;
        let task = Task::new(serde_json::json!({}));
        db.insert_task(&task).await.unwrap();
        let second = WorkerSession::new(task.id, 2);
        let first = WorkerSession::new(task.id, 1);
        db.insert_session(&second).await.unwrap();
        db.insert_session(&first).await.unwrap();

        let sessions = db.list_sessions_for_task(task.id).await.unwrap();
        let attempts: Vec<_> = sessions.iter().map(|s| s.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    // ── Context segment tests ───────────────────────────────────────

    fn segment(tier: Tier, seq: u64, content: &str) -> ContextSegment {
        let mut s = ContextSegment::new(content);
        s.tier = tier;
        s.seq = seq;
        s
    }

    #[tokio::test]
    async fn context_segments_range_scan() {
        let db = test_db().await;
        let ctx = Uuid::new_v4();
        let other = Uuid::new_v4();
        db.insert_context_segment(ctx, &segment(Tier::Recent, 1, "b"))
            .await
            .unwrap();
        db.insert_context_segment(ctx, &segment(Tier::Recent, 0, "a"))
            .await
            .unwrap();
        db.insert_context_segment(ctx, &segment(Tier::Head, 0, "h"))
            .await
            .unwrap();
        db.insert_context_segment(other, &segment(Tier::Recent, 0, "x"))
            .await
            .unwrap();

        let recent = db
            .list_context_segments(ctx, Some(Tier::Recent))
            .await
            .unwrap();
        let contents: Vec<_> = recent.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);

        let all = db.list_context_segments(ctx, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn replace_tier_swaps_segments() {
        let db = test_db().await;
        let ctx = Uuid::new_v4();
        for seq in 0..3 {
            db.insert_context_segment(ctx, &segment(Tier::Recent, seq, "old"))
                .await
                .unwrap();
        }
        db.insert_context_segment(ctx, &segment(Tier::Head, 0, "pinned"))
            .await
            .unwrap();

        db.replace_context_tier(ctx, Tier::Recent, &[segment(Tier::Recent, 7, "new")])
            .await
            .unwrap();

        let recent = db
            .list_context_segments(ctx, Some(Tier::Recent))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].seq, 7);
        let head = db.list_context_segments(ctx, Some(Tier::Head)).await.unwrap();
        assert_eq!(head[0].content, "pinned");

        assert_eq!(db.delete_context(ctx).await.unwrap(), 2);
        assert!(db.list_context_segments(ctx, None).await.unwrap().is_empty());
    }
}

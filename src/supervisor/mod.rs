//! Supervisor: worker pool, task queue, and the heartbeat/timeout protocol.
//!
//! All coordination state sits behind one mutex and is only mutated here.
//! Workers run as independent tokio tasks and report back through the
//! inbox; the supervisor is the sole writer of task and session rows.

pub mod queue;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::context::{ContextManager, ContextSegment, ContextSnapshot};
use crate::error::{Error, SupervisorError};
use crate::store::Database;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::worker::{
    Attempt, Envelope, FailureKind, MESSAGE_VERSION, SessionState, Task, TaskHandler,
    TaskOutcome, TaskOutput, TaskStatus, Worker, WorkerDeps, WorkerHandle, WorkerMessage,
    WorkerSession,
};

pub use queue::TaskQueue;

/// Inbox slots per worker slot.
const INBOX_PER_WORKER: usize = 256;

/// A task the supervisor is still responsible for.
struct TrackedTask {
    task: Task,
    waiters: Vec<oneshot::Sender<TaskOutcome>>,
    cancel_requested: bool,
}

/// A live worker and what the supervisor has observed of it.
struct ActiveSession {
    session: WorkerSession,
    handle: WorkerHandle,
    last_seen: Instant,
    /// Set by `cancel`; the worker is force-killed once this passes.
    cancel_deadline: Option<Instant>,
    /// The worker's tokio task was seen finished without a result.
    exit_observed: bool,
}

struct PoolState {
    queue: TaskQueue,
    tasks: HashMap<Uuid, TrackedTask>,
    sessions: HashMap<Uuid, ActiveSession>,
    shutting_down: bool,
}

/// Dispatches tasks to ephemeral workers and tracks them to a terminal status.
pub struct Supervisor {
    config: SupervisorConfig,
    store: Arc<dyn Database>,
    contexts: Arc<ContextManager>,
    handler: Arc<dyn TaskHandler>,
    telemetry: TelemetrySink,
    outbox: mpsc::Sender<Envelope>,
    inbox: Mutex<Option<mpsc::Receiver<Envelope>>>,
    state: Mutex<PoolState>,
    wakeup: Notify,
}

impl Supervisor {
    /// Create a supervisor with its own context manager over `store`.
    pub fn new(
        config: SupervisorConfig,
        store: Arc<dyn Database>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let telemetry = TelemetrySink::default();
        let contexts = ContextManager::new(config.context)?
            .with_store(Arc::clone(&store))
            .with_max_resident(config.max_resident_contexts)
            .with_telemetry(telemetry.clone());
        let (outbox, inbox) = mpsc::channel(config.max_workers * INBOX_PER_WORKER);

        Ok(Self {
            state: Mutex::new(PoolState {
                queue: TaskQueue::new(config.queue_capacity),
                tasks: HashMap::new(),
                sessions: HashMap::new(),
                shutting_down: false,
            }),
            config,
            store,
            contexts: Arc::new(contexts),
            handler,
            telemetry,
            outbox,
            inbox: Mutex::new(Some(inbox)),
            wakeup: Notify::new(),
        })
    }

    /// Validated configuration this supervisor was built with.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Shared context store; create contexts here before enqueueing
    /// tasks that reference them.
    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// Sink for task and compaction events. Call `events()` to subscribe.
    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Queue a task. Returns immediately; never waits on a worker.
    pub async fn enqueue(&self, mut task: Task) -> Result<Uuid, Error> {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(SupervisorError::ShuttingDown.into());
        }
        if state.queue.is_full() {
            return Err(SupervisorError::QueueFull {
                capacity: self.config.queue_capacity,
            }
            .into());
        }

        task.status = TaskStatus::Queued;
        task.max_retries.get_or_insert(self.config.max_retries);
        self.store.insert_task(&task).await?;

        let id = task.id;
        state.queue.push(id, task.priority)?;
        tracing::info!(task_id = %id, priority = task.priority, "Task queued");
        state.tasks.insert(
            id,
            TrackedTask {
                task,
                waiters: Vec::new(),
                cancel_requested: false,
            },
        );
        drop(state);

        self.wakeup.notify_one();
        Ok(id)
    }

    /// Queue a payload with an optional priority (default 0).
    pub async fn submit(
        &self,
        payload: serde_json::Value,
        priority: Option<i32>,
    ) -> Result<Uuid, Error> {
        self.enqueue(Task::new(payload).with_priority(priority.unwrap_or(0)))
            .await
    }

    /// Current status, from memory if the task is live, else from the store.
    pub async fn get_status(&self, task_id: Uuid) -> Result<TaskStatus, Error> {
        if let Some(tracked) = self.state.lock().await.tasks.get(&task_id) {
            return Ok(tracked.task.status);
        }
        match self.store.get_task(task_id).await? {
            Some(task) => Ok(task.status),
            None => Err(SupervisorError::TaskNotFound { id: task_id }.into()),
        }
    }

    /// Full task record, from memory if live, else from the store.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, Error> {
        if let Some(tracked) = self.state.lock().await.tasks.get(&task_id) {
            return Ok(Some(tracked.task.clone()));
        }
        Ok(self.store.get_task(task_id).await?)
    }

    /// Wait until the task reaches `completed` or `failed`.
    pub async fn wait_for_result(&self, task_id: Uuid) -> Result<TaskOutcome, Error> {
        let rx = {
            let mut state = self.state.lock().await;
            match state.tasks.get_mut(&task_id) {
                Some(tracked) => {
                    let (tx, rx) = oneshot::channel();
                    tracked.waiters.push(tx);
                    rx
                }
                None => {
                    drop(state);
                    return match self.store.get_task(task_id).await? {
                        Some(task) if task.status.is_terminal() => Ok(task.outcome()),
                        _ => Err(SupervisorError::TaskNotFound { id: task_id }.into()),
                    };
                }
            }
        };
        rx.await.map_err(|_| SupervisorError::ShuttingDown.into())
    }

    /// Cancel a task. A queued task fails immediately; a running one is
    /// signalled and force-killed after the grace period.
    ///
    /// Returns `false` if the task had already finished.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, Error> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(tracked) = state.tasks.get_mut(&task_id) else {
            drop(guard);
            return match self.store.get_task(task_id).await? {
                Some(_) => Ok(false),
                None => Err(SupervisorError::TaskNotFound { id: task_id }.into()),
            };
        };

        match tracked.task.status {
            TaskStatus::Queued => {
                state.queue.remove(task_id);
                tracing::info!(task_id = %task_id, "Queued task cancelled");
                self.finish_task(
                    state,
                    task_id,
                    TaskStatus::Failed,
                    None,
                    Some("cancelled".to_string()),
                )
                .await?;
                Ok(true)
            }
            TaskStatus::Assigned => {
                tracked.cancel_requested = true;
                let deadline = Instant::now() + self.config.shutdown_grace;
                if let Some(active) = state
                    .sessions
                    .values_mut()
                    .find(|a| a.session.task_id == task_id)
                {
                    active.handle.signal_cancel();
                    active.cancel_deadline = Some(deadline);
                    tracing::info!(
                        task_id = %task_id,
                        session_id = %active.session.id,
                        "Cancellation signalled"
                    );
                }
                Ok(true)
            }
            TaskStatus::Completed | TaskStatus::Failed => Ok(false),
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn active_sessions(&self) -> Vec<WorkerSession> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .map(|a| a.session.clone())
            .collect()
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Tasks not yet completed or failed.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Start workers for ready tasks until the pool is full. Returns how
    /// many were spawned.
    pub async fn spawn_next(&self) -> Result<usize, Error> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.shutting_down {
            return Ok(0);
        }

        state.queue.promote_due(Instant::now());
        let mut spawned = 0;
        while state.sessions.len() < self.config.max_workers {
            let Some(task_id) = state.queue.pop_ready() else {
                break;
            };
            let Some(tracked) = state.tasks.get_mut(&task_id) else {
                tracing::warn!(task_id = %task_id, "Queued task has no record; dropping");
                continue;
            };

            tracked.task.status = TaskStatus::Assigned;
            tracked.task.updated_at = Utc::now();
            let session = WorkerSession::new(task_id, tracked.task.attempt());
            self.store.update_task(&tracked.task).await?;
            self.store.insert_session(&session).await?;

            let budget = tracked
                .task
                .context_budget
                .unwrap_or(self.config.worker_context_tokens);
            let snapshot = match tracked.task.context_id {
                Some(context_id) => self.contexts.snapshot(context_id, budget).await?,
                None => ContextSnapshot::empty(budget),
            };

            let deps = WorkerDeps::from_config(
                &self.config,
                Arc::clone(&self.handler),
                self.outbox.clone(),
            );
            let handle = Worker::new(session.id, tracked.task.clone(), deps).spawn(snapshot);

            tracing::info!(
                task_id = %task_id,
                session_id = %session.id,
                attempt = session.attempt,
                "Worker spawned"
            );
            state.sessions.insert(
                session.id,
                ActiveSession {
                    session,
                    handle,
                    last_seen: Instant::now(),
                    cancel_deadline: None,
                    exit_observed: false,
                },
            );
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Periodic housekeeping: timeouts, cancellation grace, dead workers,
    /// then spawning.
    pub async fn tick(&self) -> Result<(), Error> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut cancel_expired = Vec::new();
        let mut lost = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (id, active) in state.sessions.iter_mut() {
                if active.cancel_deadline.is_some_and(|d| now >= d) {
                    cancel_expired.push(*id);
                } else if active.handle.is_finished() {
                    // Give in-flight messages one tick to arrive.
                    if active.exit_observed {
                        lost.push(*id);
                    } else {
                        active.exit_observed = true;
                    }
                } else if now.duration_since(active.last_seen) > self.config.worker_timeout {
                    timed_out.push(*id);
                }
            }
        }

        for id in timed_out {
            self.on_timeout(id).await?;
        }

        for id in cancel_expired {
            let mut state = self.state.lock().await;
            self.fail_session(
                &mut state,
                id,
                SessionState::Failed,
                FailureKind::Cancelled,
                "cancelled; worker killed after grace period".to_string(),
            )
            .await?;
        }

        for id in lost {
            let mut state = self.state.lock().await;
            self.fail_session(
                &mut state,
                id,
                SessionState::Failed,
                FailureKind::Lost,
                "worker exited without reporting a result".to_string(),
            )
            .await?;
        }

        self.spawn_next().await?;
        Ok(())
    }

    /// Force-terminate a silent worker and retry or fail its task.
    pub async fn on_timeout(&self, session_id: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let message = format!(
            "no heartbeat within {} ms",
            self.config.worker_timeout.as_millis()
        );
        self.fail_session(
            &mut state,
            session_id,
            SessionState::TimedOut,
            FailureKind::TimedOut,
            message,
        )
        .await
    }

    // ── Worker messages ─────────────────────────────────────────────

    /// Accept an envelope from a worker, ignoring other wire versions.
    pub async fn on_envelope(&self, envelope: Envelope) -> Result<(), Error> {
        if envelope.version != MESSAGE_VERSION {
            tracing::warn!(
                session_id = %envelope.session_id,
                version = envelope.version,
                expected = MESSAGE_VERSION,
                "Ignoring worker message with unsupported version"
            );
            return Ok(());
        }
        self.on_worker_message(envelope.session_id, envelope.message)
            .await
    }

    /// Accept a JSON-encoded envelope, e.g. from an out-of-process worker.
    pub async fn on_raw_message(&self, raw: &str) -> Result<(), Error> {
        match Envelope::decode(raw) {
            Ok(envelope) => self.on_envelope(envelope).await,
            Err(e) => {
                tracing::warn!("Ignoring undecodable worker message: {}", e);
                Ok(())
            }
        }
    }

    /// Apply one worker message to the session it came from.
    pub async fn on_worker_message(
        &self,
        session_id: Uuid,
        message: WorkerMessage,
    ) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(active) = state.sessions.get_mut(&session_id) else {
            tracing::debug!(
                session_id = %session_id,
                kind = message.type_name(),
                "Message for unknown or finished session ignored"
            );
            return Ok(());
        };

        active.last_seen = Instant::now();
        active.session.last_heartbeat = Some(Utc::now());
        let task_id = active.session.task_id;
        let mut dirty = false;
        if active.session.state == SessionState::Spawned {
            self.transition(active, SessionState::Running, None)?;
            dirty = true;
        }

        match message {
            WorkerMessage::Heartbeat { memory_bytes } => {
                active.session.observe_memory(memory_bytes);
                self.telemetry.emit(TelemetryEvent::Heartbeat {
                    session_id,
                    memory_bytes,
                });
                self.store.update_session(&active.session).await?;
            }
            WorkerMessage::Progress { percent, note } => {
                tracing::debug!(session_id = %session_id, percent, "Worker progress");
                self.telemetry.emit(TelemetryEvent::Progress {
                    session_id,
                    task_id,
                    percent,
                    note,
                });
                if dirty {
                    self.store.update_session(&active.session).await?;
                }
            }
            WorkerMessage::MemoryReport {
                current_bytes,
                peak_bytes,
                limit_bytes,
            } => {
                active.session.observe_memory(peak_bytes);
                self.telemetry.emit(TelemetryEvent::MemoryReport {
                    session_id,
                    current_bytes,
                    peak_bytes,
                    limit_bytes,
                });
                if dirty {
                    self.store.update_session(&active.session).await?;
                }
            }
            WorkerMessage::Result { output } => {
                self.complete_session(state, session_id, output).await?;
            }
            WorkerMessage::Error { kind, message } => {
                self.fail_session(state, session_id, SessionState::Failed, kind, message)
                    .await?;
            }
            WorkerMessage::Unknown => {
                tracing::warn!(session_id = %session_id, "Ignoring unknown worker message type");
                if dirty {
                    self.store.update_session(&active.session).await?;
                }
            }
        }
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Re-establish state after a restart: close orphaned sessions, put
    /// assigned tasks back in the queue, and load queued tasks.
    ///
    /// Returns the number of tasks queued.
    pub async fn recover(&self) -> Result<usize, Error> {
        for mut session in self.store.list_open_sessions().await? {
            if !session.state.is_outcome() {
                let _ = session.transition_to(
                    SessionState::Failed,
                    Some("supervisor restarted".to_string()),
                );
            }
            let _ = session.transition_to(SessionState::Terminated, None);
            self.store.update_session(&session).await?;
            tracing::info!(session_id = %session.id, "Orphaned session terminated");
        }

        for mut task in self.store.list_tasks_by_status(TaskStatus::Assigned).await? {
            task.status = TaskStatus::Queued;
            task.updated_at = Utc::now();
            self.store.update_task(&task).await?;
        }

        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for task in self.store.list_tasks_by_status(TaskStatus::Queued).await? {
            if state.tasks.contains_key(&task.id) {
                continue;
            }
            state.queue.requeue(task.id, task.priority, Instant::now());
            state.tasks.insert(
                task.id,
                TrackedTask {
                    task,
                    waiters: Vec::new(),
                    cancel_requested: false,
                },
            );
            recovered += 1;
        }
        drop(state);

        if recovered > 0 {
            tracing::info!(recovered, "Recovered queued tasks");
            self.wakeup.notify_one();
        }
        Ok(recovered)
    }

    /// Stop every worker and release all slots. In-flight tasks go back to
    /// `queued` in the store so `recover` re-runs them.
    pub async fn cleanup(&self) -> Result<(), Error> {
        let mut sessions = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            for active in state.sessions.values() {
                active.handle.signal_cancel();
            }
            std::mem::take(&mut state.sessions)
        };

        let deadline = Instant::now() + self.config.shutdown_grace;
        for active in sessions.values_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !active.handle.wait(remaining).await {
                tracing::warn!(session_id = %active.session.id, "Worker ignored shutdown; aborting");
                active.handle.abort();
            }
        }

        let mut state = self.state.lock().await;
        let mut first_error: Option<Error> = None;
        for (_, mut active) in sessions {
            if !active.session.state.is_outcome() {
                let _ = self.transition(
                    &mut active,
                    SessionState::Failed,
                    Some("supervisor shutdown".to_string()),
                );
            }
            let _ = self.transition(&mut active, SessionState::Terminated, None);
            if let Err(e) = self.store.update_session(&active.session).await {
                first_error.get_or_insert(e.into());
            }

            if let Some(tracked) = state.tasks.get_mut(&active.session.task_id) {
                tracked.task.status = TaskStatus::Queued;
                tracked.task.updated_at = Utc::now();
                if let Err(e) = self.store.update_task(&tracked.task).await {
                    first_error.get_or_insert(e.into());
                }
            }
        }

        // Dropping the trackers releases anyone blocked in wait_for_result.
        state.tasks.clear();
        state.queue.clear();
        tracing::info!("Supervisor cleaned up");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drive the supervisor until `shutdown` resolves or a store error
    /// occurs, then clean up.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()> + Send) -> Result<(), Error> {
        let mut inbox = self
            .inbox
            .lock()
            .await
            .take()
            .ok_or(SupervisorError::AlreadyRunning)?;
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(max_workers = self.config.max_workers, "Supervisor running");
        let outcome = loop {
            let step = tokio::select! {
                biased;

                _ = &mut shutdown => break Ok(()),
                // Ahead of the inbox so a chatty pool cannot starve timeouts.
                _ = ticker.tick() => self.tick().await,
                Some(envelope) = inbox.recv() => self.on_envelope(envelope).await,
                _ = self.wakeup.notified() => self.spawn_next().await.map(|_| ()),
            };
            if let Err(e) = step {
                tracing::error!("Supervisor stopping on fatal error: {}", e);
                break Err(e);
            }
        };

        let cleaned = self.cleanup().await;
        outcome.and(cleaned)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn transition(
        &self,
        active: &mut ActiveSession,
        to: SessionState,
        reason: Option<String>,
    ) -> Result<(), SupervisorError> {
        let from = active.session.state;
        active
            .session
            .transition_to(to, reason.clone())
            .map_err(|_| SupervisorError::InvalidTransition {
                id: active.session.id,
                state: from.to_string(),
                target: to.to_string(),
            })?;
        tracing::debug!(session_id = %active.session.id, %from, %to, "Session transition");
        self.telemetry.emit(TelemetryEvent::SessionState {
            session_id: active.session.id,
            task_id: active.session.task_id,
            from,
            to,
            reason,
        });
        Ok(())
    }

    async fn complete_session(
        &self,
        state: &mut PoolState,
        session_id: Uuid,
        output: TaskOutput,
    ) -> Result<(), Error> {
        let Some(mut active) = state.sessions.remove(&session_id) else {
            return Ok(());
        };
        active.handle.abort();
        self.transition(&mut active, SessionState::Completed, None)?;
        self.transition(&mut active, SessionState::Terminated, None)?;
        self.store.update_session(&active.session).await?;

        let task_id = active.session.task_id;
        let context_id = state.tasks.get(&task_id).and_then(|t| t.task.context_id);
        if let (Some(context_id), Some(summary)) = (context_id, output.summary.as_deref()) {
            self.contexts
                .append(context_id, ContextSegment::new(summary))
                .await?;
        }

        tracing::info!(
            task_id = %task_id,
            session_id = %session_id,
            duration_ms = output.duration_ms,
            "Task completed"
        );
        self.finish_task(state, task_id, TaskStatus::Completed, Some(output), None)
            .await?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// End a session with a failure outcome and retry or fail its task.
    async fn fail_session(
        &self,
        state: &mut PoolState,
        session_id: Uuid,
        outcome: SessionState,
        kind: FailureKind,
        message: String,
    ) -> Result<(), Error> {
        let Some(mut active) = state.sessions.remove(&session_id) else {
            return Ok(());
        };
        active.handle.abort();

        let reason = match kind {
            FailureKind::Cancelled => "cancelled".to_string(),
            _ => message.clone(),
        };
        self.transition(&mut active, outcome, Some(reason))?;
        self.transition(&mut active, SessionState::Terminated, None)?;
        self.store.update_session(&active.session).await?;

        let task_id = active.session.task_id;
        let Some(tracked) = state.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        tracked.task.history.push(Attempt {
            attempt: active.session.attempt,
            session_id,
            kind,
            message: message.clone(),
            at: Utc::now(),
        });

        let kind = if tracked.cancel_requested {
            FailureKind::Cancelled
        } else {
            kind
        };
        if kind.is_retryable() && tracked.task.retries_remaining() {
            tracked.task.retries += 1;
            tracked.task.status = TaskStatus::Queued;
            tracked.task.updated_at = Utc::now();
            self.store.update_task(&tracked.task).await?;

            let delay = self.backoff(tracked.task.retries);
            state
                .queue
                .requeue(task_id, tracked.task.priority, Instant::now() + delay);
            tracing::warn!(
                task_id = %task_id,
                session_id = %session_id,
                %kind,
                retry = tracked.task.retries,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed; retrying: {}",
                message
            );
            self.telemetry.emit(TelemetryEvent::TaskRetried {
                task_id,
                attempt: tracked.task.attempt(),
                kind,
                delay_ms: delay.as_millis() as u64,
            });
        } else {
            tracing::warn!(
                task_id = %task_id,
                session_id = %session_id,
                %kind,
                retries = tracked.task.retries,
                "Task failed: {}",
                message
            );
            let summary = format!("{kind}: {message}");
            self.finish_task(state, task_id, TaskStatus::Failed, None, Some(summary))
                .await?;
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Move a task to a terminal status, persist it, and wake its waiters.
    async fn finish_task(
        &self,
        state: &mut PoolState,
        task_id: Uuid,
        status: TaskStatus,
        output: Option<TaskOutput>,
        error: Option<String>,
    ) -> Result<(), Error> {
        let Some(mut tracked) = state.tasks.remove(&task_id) else {
            return Ok(());
        };
        tracked.task.status = status;
        tracked.task.result = output;
        tracked.task.error = error;
        tracked.task.updated_at = Utc::now();
        self.store.update_task(&tracked.task).await?;

        // The store holds the context now; keep it in memory only while
        // another live task still uses it.
        if let Some(context_id) = tracked.task.context_id
            && !state
                .tasks
                .values()
                .any(|t| t.task.context_id == Some(context_id))
        {
            self.contexts.evict(context_id).await;
        }

        let outcome = tracked.task.outcome();
        for waiter in tracked.waiters {
            let _ = waiter.send(outcome.clone());
        }
        self.telemetry.emit(TelemetryEvent::TaskFinished {
            task_id,
            status,
            retries: tracked.task.retries,
        });
        Ok(())
    }

    /// Exponential backoff with jitter, capped at `retry_backoff_max`.
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.retry_backoff.as_millis() as f64;
        let exp = base * 2f64.powi(retry.saturating_sub(1).min(16) as i32);
        let capped = exp.min(self.config.retry_backoff_max.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_millis((capped * jitter) as u64)
    }
}

//! Ephemeral worker execution.
//!
//! A worker runs exactly one attempt of one task inside its own tokio task.
//! It owns its arena and context snapshot, reports to the supervisor only
//! through messages, and ends after sending its result or error.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::{StreamLimits, SupervisorConfig};
use crate::context::ContextSnapshot;
use crate::error::WorkerError;
use crate::stream::BoundedLineReader;
use crate::worker::memory::MemoryArena;
use crate::worker::message::{Envelope, WorkerMessage};
use crate::worker::task::{Task, TaskHandler, TaskOutput};

/// Everything a handler can see while it runs.
pub struct WorkerContext {
    session_id: Uuid,
    task_id: Uuid,
    attempt: u32,
    snapshot: ContextSnapshot,
    arena: MemoryArena,
    stream_limits: StreamLimits,
    outbox: mpsc::Sender<Envelope>,
    cancel: watch::Receiver<bool>,
}

impl WorkerContext {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    pub fn stream_limits(&self) -> StreamLimits {
        self.stream_limits
    }

    /// Report progress. Dropped if the supervisor's inbox is full.
    pub fn progress(&self, percent: u8, note: Option<String>) {
        self.post(WorkerMessage::Progress {
            percent: percent.min(100),
            note,
        });
    }

    /// Whether the supervisor asked this worker to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Open a file through the bounded reader with this worker's limits.
    pub async fn open_lines(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<BoundedLineReader<tokio::fs::File>, WorkerError> {
        self.open_lines_at(path, 0).await
    }

    /// Like [`open_lines`](Self::open_lines), starting at a byte offset.
    pub async fn open_lines_at(
        &self,
        path: impl AsRef<Path>,
        offset: u64,
    ) -> Result<BoundedLineReader<tokio::fs::File>, WorkerError> {
        let path = path.as_ref();
        BoundedLineReader::open_at(path, offset, self.stream_limits)
            .await
            .map_err(|e| WorkerError::Execution(format!("{}: {e}", path.display())))
    }

    fn post(&self, message: WorkerMessage) {
        if let Err(e) = self.outbox.try_send(Envelope::new(self.session_id, message)) {
            tracing::debug!(session_id = %self.session_id, "Dropped worker message: {}", e);
        }
    }

    /// Messages that must arrive wait for inbox space.
    async fn deliver(&self, message: WorkerMessage) {
        let envelope = Envelope::new(self.session_id, message);
        if self.outbox.send(envelope).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "Supervisor inbox closed");
        }
    }
}

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub handler: Arc<dyn TaskHandler>,
    pub outbox: mpsc::Sender<Envelope>,
    pub heartbeat_interval: Duration,
    pub max_runtime: Duration,
    pub memory_bytes: usize,
    pub stream_limits: StreamLimits,
}

impl WorkerDeps {
    pub fn from_config(
        config: &SupervisorConfig,
        handler: Arc<dyn TaskHandler>,
        outbox: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            handler,
            outbox,
            heartbeat_interval: config.heartbeat_interval,
            max_runtime: config.worker_max_runtime,
            memory_bytes: config.worker_memory_bytes,
            stream_limits: config.stream,
        }
    }
}

/// Worker that executes a single task attempt.
pub struct Worker {
    session_id: Uuid,
    task: Task,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(session_id: Uuid, task: Task, deps: WorkerDeps) -> Self {
        Self {
            session_id,
            task,
            deps,
        }
    }

    /// Run the task to completion, heartbeating until the handler finishes,
    /// the cancel flag is raised, or the runtime budget runs out.
    ///
    /// Always sends a final `MemoryReport` followed by `Result` or `Error`.
    pub async fn run(
        self,
        snapshot: ContextSnapshot,
        cancel: watch::Receiver<bool>,
    ) -> Result<TaskOutput, WorkerError> {
        let Worker {
            session_id,
            task,
            deps,
        } = self;
        let ctx = WorkerContext {
            session_id,
            task_id: task.id,
            attempt: task.attempt(),
            snapshot,
            arena: MemoryArena::new(deps.memory_bytes),
            stream_limits: deps.stream_limits,
            outbox: deps.outbox.clone(),
            cancel: cancel.clone(),
        };

        tracing::debug!(
            session_id = %session_id,
            task_id = %task.id,
            attempt = ctx.attempt,
            context_tokens = ctx.snapshot.total_tokens,
            "Worker started"
        );

        let started = Instant::now();
        let outcome = {
            let work = AssertUnwindSafe(deps.handler.run(&ctx, task.payload)).catch_unwind();
            tokio::pin!(work);
            let deadline = tokio::time::sleep(deps.max_runtime);
            tokio::pin!(deadline);
            let mut heartbeat = tokio::time::interval(deps.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cancel = cancel;

            loop {
                tokio::select! {
                    biased;

                    _ = heartbeat.tick() => {
                        ctx.post(WorkerMessage::Heartbeat {
                            memory_bytes: ctx.arena.used() as u64,
                        });
                    }
                    true = cancel.wait_for(|c| *c).map(|r| r.is_ok()) => {
                        break Err(WorkerError::Cancelled);
                    }
                    _ = &mut deadline => {
                        break Err(WorkerError::ResourceExhausted(format!(
                            "runtime budget of {:?} exceeded",
                            deps.max_runtime
                        )));
                    }
                    result = &mut work => {
                        break match result {
                            Ok(result) => result,
                            Err(panic) => Err(WorkerError::Execution(format!(
                                "handler panicked: {}",
                                panic_message(panic.as_ref())
                            ))),
                        };
                    }
                }
            }
        };

        ctx.deliver(WorkerMessage::MemoryReport {
            current_bytes: ctx.arena.used() as u64,
            peak_bytes: ctx.arena.peak() as u64,
            limit_bytes: ctx.arena.limit() as u64,
        })
        .await;

        let outcome = outcome.map(|mut output| {
            output.duration_ms = started.elapsed().as_millis() as u64;
            output
        });
        match outcome {
            Ok(ref output) => {
                ctx.deliver(WorkerMessage::Result {
                    output: output.clone(),
                })
                .await;
            }
            Err(ref e) => {
                ctx.deliver(WorkerMessage::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                })
                .await;
            }
        }
        outcome
    }

    /// Start the worker on its own tokio task.
    pub fn spawn(self, snapshot: ContextSnapshot) -> WorkerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session_id = self.session_id;
        let join = tokio::spawn(async move {
            if let Err(e) = self.run(snapshot, cancel_rx).await {
                tracing::debug!(session_id = %session_id, "Worker finished with error: {}", e);
            }
        });
        WorkerHandle {
            session_id,
            cancel: cancel_tx,
            join,
        }
    }
}

/// Supervisor's grip on a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    session_id: Uuid,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Ask the worker to stop at its next await point.
    pub fn signal_cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Force-terminate the worker.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker's task to end, up to `grace`. Returns whether it did.
    pub async fn wait(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, &mut self.join).await.is_ok()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

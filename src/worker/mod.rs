//! Worker system: isolated, single-use task execution.
//!
//! Core components:
//! - `task`: Task types, retry history, and the `TaskHandler` seam
//! - `state`: Session state machine (Spawned → Running → outcome → Terminated)
//! - `memory`: Per-worker memory arena
//! - `message`: Versioned worker-to-supervisor messages
//! - `worker`: The worker run loop (heartbeat, cancel, runtime budget)

pub mod memory;
pub mod message;
pub mod state;
pub mod task;
pub mod worker;

pub use memory::MemoryArena;
pub use message::{Envelope, MESSAGE_VERSION, WorkerMessage};
pub use state::{SessionState, StateTransition, WorkerSession};
pub use task::{
    Attempt, FailureKind, Task, TaskHandler, TaskOutcome, TaskOutput, TaskStatus,
};
pub use worker::{Worker, WorkerContext, WorkerDeps, WorkerHandle};

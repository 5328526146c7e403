//! Error types for shiftwork.

use uuid::Uuid;

use crate::worker::task::FailureKind;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the supervisor's caller-facing API.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Task queue full ({capacity} tasks waiting)")]
    QueueFull { capacity: usize },

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Session {id} cannot transition from {state} to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Supervisor run loop already started")]
    AlreadyRunning,
}

/// Failures a worker reports for its task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Cancelled by supervisor")]
    Cancelled,
}

impl WorkerError {
    /// Classification used for retry decisions and history.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Execution(_) => FailureKind::Execution,
            Self::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Context manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Head tier budget exceeded: {tokens} tokens would exceed {budget}")]
    HeadBudgetExceeded { tokens: usize, budget: usize },

    #[error("Invalid tier budgets: {0}")]
    InvalidBudgets(String),

    #[error("Context store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Bounded stream reader errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Invalid reader limits: {0}")]
    InvalidLimits(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

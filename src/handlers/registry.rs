//! Routes task payloads to handlers by their `kind` field.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::WorkerError;
use crate::handlers::builtin::{EchoHandler, ScanFileHandler};
use crate::worker::{TaskHandler, TaskOutput, WorkerContext};

/// Registry of task handlers keyed by payload kind.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with `echo` and `scan_file` installed.
    pub fn with_builtins() -> Self {
        let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(EchoHandler::KIND.to_string(), Arc::new(EchoHandler));
        handlers.insert(ScanFileHandler::KIND.to_string(), Arc::new(ScanFileHandler));
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Register a handler, replacing any previous one for `kind`.
    pub async fn register(&self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let kind = kind.into();
        if self
            .handlers
            .write()
            .await
            .insert(kind.clone(), handler)
            .is_some()
        {
            tracing::warn!(kind = %kind, "Replaced existing task handler");
        } else {
            tracing::debug!("Registered task handler: {}", kind);
        }
    }

    pub async fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(kind).cloned()
    }

    pub async fn has(&self, kind: &str) -> bool {
        self.handlers.read().await.contains_key(kind)
    }

    /// All registered kinds.
    pub async fn kinds(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for HandlerRegistry {
    async fn run(
        &self,
        ctx: &WorkerContext,
        payload: serde_json::Value,
    ) -> Result<TaskOutput, WorkerError> {
        let kind = payload
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| WorkerError::Execution("payload has no 'kind'".to_string()))?;
        let handler = self
            .get(kind)
            .await
            .ok_or_else(|| WorkerError::Execution(format!("no handler for kind '{kind}'")))?;
        handler.run(ctx, payload).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::config::SupervisorConfig;
    use crate::context::ContextSnapshot;
    use crate::worker::{Task, Worker, WorkerDeps};

    struct Constant;

    #[async_trait]
    impl TaskHandler for Constant {
        async fn run(&self, _ctx: &WorkerContext, _payload: serde_json::Value) -> Result<TaskOutput, WorkerError> {
            Ok(TaskOutput::new(json!(42)))
        }
    }

    async fn run_through(registry: HandlerRegistry, payload: serde_json::Value) -> Result<TaskOutput, WorkerError> {
        let (tx, _rx) = mpsc::channel(64);
        let config = SupervisorConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let deps = WorkerDeps::from_config(&config, Arc::new(registry), tx);
        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        Worker::new(Uuid::new_v4(), Task::new(payload), deps)
            .run(ContextSnapshot::empty(0), cancel_rx)
            .await
    }

    #[tokio::test]
    async fn test_builtins_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.has("echo").await);
        assert!(registry.has("scan_file").await);
        assert_eq!(registry.kinds().await.len(), 2);
    }

    #[tokio::test]
    async fn test_routes_by_kind() {
        let registry = HandlerRegistry::new();
        registry.register("constant", Arc::new(Constant)).await;
        let output = run_through(registry, json!({"kind": "constant"})).await.unwrap();
        assert_eq!(output.value, json!(42));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_execution_error() {
        let err = run_through(HandlerRegistry::new(), json!({"kind": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Execution(ref m) if m.contains("nope")));

        let err = run_through(HandlerRegistry::new(), json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::Execution(_)));
    }
}

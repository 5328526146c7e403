//! Echo handler: returns `payload.value` (or the whole payload) unchanged.

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::worker::{TaskHandler, TaskOutput, WorkerContext};

pub struct EchoHandler;

impl EchoHandler {
    pub const KIND: &'static str = "echo";
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(
        &self,
        ctx: &WorkerContext,
        payload: serde_json::Value,
    ) -> Result<TaskOutput, WorkerError> {
        let value = payload.get("value").cloned().unwrap_or(payload);
        let summary = format!("echo (attempt {}): {}", ctx.attempt(), value);
        Ok(TaskOutput::new(value).with_summary(summary))
    }
}

//! `scan_file` handler: streams a file through the bounded reader and
//! reports line statistics plus a resume cursor.
//!
//! Payload:
//! ```json
//! { "kind": "scan_file", "path": "logs/app.log", "offset": 0, "pattern": "ERROR" }
//! ```
//! `offset` and `pattern` are optional. When the line cap is hit the output
//! has `partial: true` and `next_offset` to continue from.

use async_trait::async_trait;
use serde_json::json;

use crate::error::WorkerError;
use crate::handlers::require_str;
use crate::worker::{TaskHandler, TaskOutput, WorkerContext};

/// Lines between progress reports and cancellation checks.
const REPORT_EVERY: usize = 256;

pub struct ScanFileHandler;

impl ScanFileHandler {
    pub const KIND: &'static str = "scan_file";
}

#[async_trait]
impl TaskHandler for ScanFileHandler {
    async fn run(
        &self,
        ctx: &WorkerContext,
        payload: serde_json::Value,
    ) -> Result<TaskOutput, WorkerError> {
        let path = require_str(&payload, "path")?;
        let offset = payload.get("offset").and_then(|v| v.as_u64()).unwrap_or(0);
        let pattern = payload.get("pattern").and_then(|v| v.as_str());

        let mut reader = ctx.open_lines_at(path, offset).await?;
        let _lease = ctx.arena().charge(reader.buffered_bytes())?;
        let max_lines = ctx.stream_limits().max_lines.max(1);

        let mut lines = 0usize;
        let mut matches = 0usize;
        let mut chars = 0usize;
        let mut longest = 0usize;
        while let Some(record) = reader
            .next_line()
            .await
            .map_err(|e| WorkerError::Execution(format!("{path}: {e}")))?
        {
            lines += 1;
            let len = record.text.chars().count();
            chars += len;
            longest = longest.max(len);
            if pattern.is_some_and(|p| record.text.contains(p)) {
                matches += 1;
            }

            if lines % REPORT_EVERY == 0 {
                if ctx.is_cancelled() {
                    return Err(WorkerError::Cancelled);
                }
                let percent = (lines * 100 / max_lines).min(99) as u8;
                ctx.progress(percent, Some(format!("{lines} lines")));
                tokio::task::yield_now().await;
            }
        }

        let cursor = reader.cursor();
        let summary = if cursor.partial {
            format!(
                "{path}: scanned {lines} lines from offset {offset}, stopped at the line cap (resume at {})",
                cursor.offset
            )
        } else {
            format!("{path}: scanned {lines} lines from offset {offset}")
        };
        ctx.progress(100, None);

        let value = json!({
            "path": path,
            "lines": lines,
            "chars": chars,
            "longest_line": longest,
            "matches": pattern.map(|_| matches),
            "truncated": cursor.truncated,
            "partial": cursor.partial,
            "next_offset": cursor.offset,
        });
        Ok(TaskOutput::new(value).with_summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::*;
    use crate::config::{StreamLimits, SupervisorConfig};
    use crate::context::ContextSnapshot;
    use crate::worker::{Task, Worker, WorkerDeps};

    async fn scan(config: SupervisorConfig, payload: serde_json::Value) -> Result<TaskOutput, WorkerError> {
        let (tx, _rx) = mpsc::channel(1024);
        let deps = WorkerDeps::from_config(&config, Arc::new(ScanFileHandler), tx);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        Worker::new(Uuid::new_v4(), Task::new(payload), deps)
            .run(ContextSnapshot::empty(0), cancel_rx)
            .await
    }

    fn config(limits: StreamLimits) -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval: Duration::from_secs(60),
            stream: limits,
            ..Default::default()
        }
    }

    fn write_lines(n: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..n {
            writeln!(file, "line {i}{}", if i % 10 == 0 { " ERROR" } else { "" }).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_scan_whole_file() {
        let file = write_lines(100);
        let output = scan(
            config(StreamLimits::default()),
            json!({"kind": "scan_file", "path": file.path(), "pattern": "ERROR"}),
        )
        .await
        .unwrap();

        assert_eq!(output.value["lines"], 100);
        assert_eq!(output.value["matches"], 10);
        assert_eq!(output.value["partial"], false);
        assert!(output.summary.unwrap().contains("scanned 100 lines"));
    }

    #[tokio::test]
    async fn test_scan_stops_at_cap_and_resumes() {
        let file = write_lines(10_000);
        let limits = StreamLimits::default();
        let first = scan(config(limits), json!({"kind": "scan_file", "path": file.path()}))
            .await
            .unwrap();
        assert_eq!(first.value["lines"], 2_000);
        assert_eq!(first.value["partial"], true);

        let next = first.value["next_offset"].as_u64().unwrap();
        let second = scan(
            config(limits),
            json!({"kind": "scan_file", "path": file.path(), "offset": next}),
        )
        .await
        .unwrap();
        assert_eq!(second.value["lines"], 2_000);
        assert!(second.value["next_offset"].as_u64().unwrap() > next);
    }

    #[tokio::test]
    async fn test_scan_charges_arena() {
        let file = write_lines(10);
        let cfg = SupervisorConfig {
            worker_memory_bytes: 1024,
            ..config(StreamLimits::default())
        };
        let err = scan(cfg, json!({"kind": "scan_file", "path": file.path()}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::worker::FailureKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_missing_path() {
        let err = scan(config(StreamLimits::default()), json!({"kind": "scan_file"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Execution(_)));

        let err = scan(
            config(StreamLimits::default()),
            json!({"kind": "scan_file", "path": "/definitely/not/here.log"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkerError::Execution(_)));
    }
}

//! Telemetry events broadcast by the supervisor and context manager.
//!
//! Consumers subscribe through [`TelemetrySink::events`]; a slow consumer
//! loses the oldest events rather than slowing the emitter.

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::context::CompactionReport;
use crate::worker::{FailureKind, SessionState, TaskStatus};

/// Default buffer of the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A single observable event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Heartbeat {
        session_id: Uuid,
        memory_bytes: u64,
    },
    Progress {
        session_id: Uuid,
        task_id: Uuid,
        percent: u8,
        note: Option<String>,
    },
    MemoryReport {
        session_id: Uuid,
        current_bytes: u64,
        peak_bytes: u64,
        limit_bytes: u64,
    },
    Compaction(CompactionReport),
    SessionState {
        session_id: Uuid,
        task_id: Uuid,
        from: SessionState,
        to: SessionState,
        reason: Option<String>,
    },
    TaskRetried {
        task_id: Uuid,
        attempt: u32,
        kind: FailureKind,
        delay_ms: u64,
    },
    TaskFinished {
        task_id: Uuid,
        status: TaskStatus,
        retries: u32,
    },
}

/// Cloneable handle to the telemetry channel.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TelemetrySink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    /// Events from now on as a stream. Lagged events are skipped.
    pub fn events(&self) -> impl Stream<Item = TelemetryEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::debug!("Telemetry subscriber lagged: {}", e);
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_stream_subscribers() {
        let sink = TelemetrySink::new(16);
        let mut events = Box::pin(sink.events());

        let task_id = Uuid::new_v4();
        sink.emit(TelemetryEvent::TaskFinished {
            task_id,
            status: TaskStatus::Completed,
            retries: 0,
        });

        let event = events.next().await.unwrap();
        assert_eq!(
            event,
            TelemetryEvent::TaskFinished {
                task_id,
                status: TaskStatus::Completed,
                retries: 0
            }
        );
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_ahead() {
        let sink = TelemetrySink::new(2);
        let mut events = Box::pin(sink.events());
        for i in 0..5u64 {
            sink.emit(TelemetryEvent::Heartbeat {
                session_id: Uuid::nil(),
                memory_bytes: i,
            });
        }
        match events.next().await.unwrap() {
            TelemetryEvent::Heartbeat { memory_bytes, .. } => assert_eq!(memory_bytes, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let sink = TelemetrySink::default();
        sink.emit(TelemetryEvent::TaskRetried {
            task_id: Uuid::nil(),
            attempt: 2,
            kind: FailureKind::TimedOut,
            delay_ms: 500,
        });
    }

    #[test]
    fn event_wire_format() {
        let json = serde_json::to_value(TelemetryEvent::Heartbeat {
            session_id: Uuid::nil(),
            memory_bytes: 7,
        })
        .unwrap();
        assert_eq!(json["event"], "heartbeat");
        assert_eq!(json["memory_bytes"], 7);
    }
}

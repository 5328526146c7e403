//! Messages a worker sends to the supervisor.
//!
//! Workers never touch the store; everything they observe reaches the
//! supervisor as an [`Envelope`] over an in-memory channel. The JSON form is
//! what an out-of-process worker would write to its pipe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::task::{FailureKind, TaskOutput};

/// Wire version of [`Envelope`]. Bump when a variant changes shape.
pub const MESSAGE_VERSION: u16 = 1;

/// Observation emitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Liveness signal, carrying the arena usage at send time.
    Heartbeat { memory_bytes: u64 },
    Progress {
        percent: u8,
        #[serde(default)]
        note: Option<String>,
    },
    MemoryReport {
        current_bytes: u64,
        peak_bytes: u64,
        limit_bytes: u64,
    },
    Result { output: TaskOutput },
    Error { kind: FailureKind, message: String },
    /// Any `type` this build does not know.
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::Progress { .. } => "progress",
            Self::MemoryReport { .. } => "memory_report",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// A message tagged with its sender and wire version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub session_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub message: WorkerMessage,
}

impl Envelope {
    pub fn new(session_id: Uuid, message: WorkerMessage) -> Self {
        Self {
            version: MESSAGE_VERSION,
            session_id,
            sent_at: Utc::now(),
            message,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_wire_format() {
        let msg = WorkerMessage::Heartbeat { memory_bytes: 42 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat", "memory_bytes": 42}));
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let session_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"version":1,"session_id":"{session_id}","sent_at":"2026-01-01T00:00:00Z","message":{{"type":"telepathy"}}}}"#
        );
        let envelope = Envelope::decode(&raw).unwrap();
        assert_eq!(envelope.message, WorkerMessage::Unknown);
        assert_eq!(envelope.session_id, session_id);
    }

    #[test]
    fn error_message_carries_kind() {
        let env = Envelope::new(
            Uuid::new_v4(),
            WorkerMessage::Error {
                kind: FailureKind::ResourceExhausted,
                message: "arena full".into(),
            },
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.message.type_name(), "error");
    }

    #[test]
    fn progress_note_is_optional() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"progress","percent":50}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Progress {
                percent: 50,
                note: None
            }
        );
    }
}

//! Task handlers: the registry that routes payloads by `kind`, and the
//! handlers shipped with the binary.

pub mod builtin;
pub mod registry;

pub use registry::HandlerRegistry;

use crate::error::WorkerError;

/// Extract a required string parameter from a payload.
pub fn require_str<'a>(payload: &'a serde_json::Value, name: &str) -> Result<&'a str, WorkerError> {
    payload
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| WorkerError::Execution(format!("missing '{name}' parameter")))
}

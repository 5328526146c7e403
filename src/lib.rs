//! Shiftwork: supervised ephemeral workers with tiered, token-budgeted context.

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

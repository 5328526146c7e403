//! Persistence layer: libSQL-backed storage for tasks, sessions and context.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;

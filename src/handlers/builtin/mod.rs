//! Built-in task handlers.

pub mod echo;
pub mod scan;

pub use echo::EchoHandler;
pub use scan::ScanFileHandler;

//! Token-budgeted, four-tier context.
//!
//! Each context keeps pinned framing (head), raw recent segments, and two
//! levels of summaries (mid, long). Appends trigger compaction when a tier or
//! the whole context runs over budget; workers receive a bounded snapshot.

pub mod manager;
pub mod segment;
pub mod summarizer;
pub mod tiered;

pub use manager::ContextManager;
pub use segment::{ContextSegment, Tier, estimate_tokens};
pub use summarizer::{ExtractiveSummarizer, Summarizer};
pub use tiered::{CompactionReport, ContextSnapshot, TierUsage, TieredContext};

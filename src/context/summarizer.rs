//! Summarization used by compaction.

use crate::context::segment::{ContextSegment, truncate_to_tokens};

/// Condenses several segments into shorter text.
///
/// Implementations may return more than `target_tokens`; the caller cuts the
/// result to the target, so budget compliance never depends on the
/// summarizer.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, segments: &[ContextSegment], target_tokens: usize) -> String;
}

/// Keeps the leading line of each segment, newest last, under a header
/// recording what was folded in.
#[derive(Debug, Default, Clone)]
pub struct ExtractiveSummarizer;

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, segments: &[ContextSegment], target_tokens: usize) -> String {
        let folded: usize = segments.iter().map(|s| s.tokens).sum();
        let header = format!("[summary of {} segments, {folded} tokens]", segments.len());
        if segments.is_empty() {
            return header;
        }

        // Equal share per segment so older items are not crowded out.
        let per_segment = (target_tokens / segments.len()).max(1);
        let mut out = header;
        for segment in segments {
            let lead = segment
                .content
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("");
            if lead.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str("- ");
            out.push_str(&truncate_to_tokens(lead, per_segment));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::segment::estimate_tokens;

    #[test]
    fn keeps_lead_lines() {
        let segments = vec![
            ContextSegment::new("first finding\nmore detail"),
            ContextSegment::new("\n  second finding  \n"),
        ];
        let summary = ExtractiveSummarizer.summarize(&segments, 100);
        assert!(summary.starts_with("[summary of 2 segments"));
        assert!(summary.contains("- first finding"));
        assert!(summary.contains("- second finding"));
        assert!(!summary.contains("more detail"));
    }

    #[test]
    fn shares_scale_with_target() {
        let long = "x".repeat(10_000);
        let segments = vec![ContextSegment::new(long.clone()), ContextSegment::new(long)];
        let summary = ExtractiveSummarizer.summarize(&segments, 50);
        // Header plus two ~25-token leads.
        assert!(estimate_tokens(&summary) < 80);
    }
}

//! Four-tier token-budgeted context with compaction.

use std::collections::VecDeque;

use serde::Serialize;
use uuid::Uuid;

use crate::config::ContextBudgets;
use crate::context::segment::{ContextSegment, Tier, estimate_tokens, truncate_to_tokens};
use crate::context::summarizer::Summarizer;
use crate::error::ContextError;

/// Share of the folded tokens a summary may keep.
const SUMMARY_RATIO: f64 = 0.25;

/// Tokens held per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    /// Pinned tokens; never compacted.
    pub head: usize,
    /// Newest segments, first to be folded when over budget.
    pub recent: usize,
    /// Summaries of folded recent segments.
    pub mid: usize,
    /// Summaries of folded mid segments.
    pub long: usize,
}

impl TierUsage {
    pub fn total(&self) -> usize {
        self.head + self.recent + self.mid + self.long
    }

    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Head => self.head,
            Tier::Recent => self.recent,
            Tier::Mid => self.mid,
            Tier::Long => self.long,
        }
    }
}

/// What one compaction pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompactionReport {
    pub context_id: Uuid,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Recent segments folded into a mid summary.
    pub recent_folded: usize,
    /// Mid segments folded into a long summary.
    pub mid_folded: usize,
    /// The long tier was re-summarized into a single segment.
    pub long_resummarized: bool,
}

impl CompactionReport {
    pub fn is_noop(&self) -> bool {
        self.recent_folded == 0 && self.mid_folded == 0 && !self.long_resummarized
    }
}

/// Context handed to a worker: a budget-bounded selection of segments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSnapshot {
    pub context_id: Option<Uuid>,
    pub budget: usize,
    pub total_tokens: usize,
    /// Head, then long, mid and recent, each oldest first.
    pub segments: Vec<ContextSegment>,
    /// Segments left out because they did not fit.
    pub omitted: usize,
}

impl ContextSnapshot {
    pub fn empty(budget: usize) -> Self {
        Self {
            context_id: None,
            budget,
            total_tokens: 0,
            segments: Vec::new(),
            omitted: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments joined into a single prompt-ready string.
    pub fn render(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// One context's tiers.
#[derive(Debug, Clone)]
pub struct TieredContext {
    id: Uuid,
    budgets: ContextBudgets,
    tiers: [VecDeque<ContextSegment>; 4],
    usage: [usize; 4],
    next_seq: [u64; 4],
}

impl TieredContext {
    pub fn new(id: Uuid, budgets: ContextBudgets) -> Self {
        Self {
            id,
            budgets,
            tiers: Default::default(),
            usage: [0; 4],
            next_seq: [0; 4],
        }
    }

    /// Rebuild a context from stored segments (any order).
    pub fn from_segments(
        id: Uuid,
        budgets: ContextBudgets,
        mut segments: Vec<ContextSegment>,
    ) -> Self {
        segments.sort_by_key(|s| (s.tier, s.seq));
        let mut ctx = Self::new(id, budgets);
        for segment in segments {
            let i = segment.tier.index();
            ctx.usage[i] += segment.tokens;
            ctx.next_seq[i] = ctx.next_seq[i].max(segment.seq + 1);
            ctx.tiers[i].push_back(segment);
        }
        ctx
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn budget(&self, tier: Tier) -> usize {
        match tier {
            Tier::Head => self.budgets.head,
            Tier::Recent => self.budgets.recent,
            Tier::Mid => self.budgets.mid,
            Tier::Long => self.budgets.long,
        }
    }

    /// Tokens currently held in each tier.
    pub fn usage(&self) -> TierUsage {
        TierUsage {
            head: self.usage[0],
            recent: self.usage[1],
            mid: self.usage[2],
            long: self.usage[3],
        }
    }

    /// Segments of one tier, oldest first.
    pub fn segments(&self, tier: Tier) -> impl DoubleEndedIterator<Item = &ContextSegment> {
        self.tiers[tier.index()].iter()
    }

    /// Pin a segment in the head tier.
    pub fn append_head(&mut self, segment: ContextSegment) -> Result<ContextSegment, ContextError> {
        let used = self.usage[Tier::Head.index()];
        if used + segment.tokens > self.budgets.head {
            return Err(ContextError::HeadBudgetExceeded {
                tokens: used + segment.tokens,
                budget: self.budgets.head,
            });
        }
        Ok(self.push(Tier::Head, segment))
    }

    /// Append to the recent tier, compacting if the result is over budget.
    ///
    /// A segment larger than the whole recent tier is cut to fit it.
    pub fn append(
        &mut self,
        summarizer: &dyn Summarizer,
        mut segment: ContextSegment,
    ) -> (ContextSegment, Option<CompactionReport>) {
        let budget = self.budgets.recent;
        if segment.tokens > budget {
            segment.content = truncate_to_tokens(&segment.content, budget);
            segment.tokens = budget;
        }
        let stored = self.push(Tier::Recent, segment);

        let report = if self.needs_compaction() {
            Some(self.compact(summarizer))
        } else {
            None
        };
        (stored, report)
    }

    pub fn needs_compaction(&self) -> bool {
        self.usage[Tier::Recent.index()] > self.budgets.recent
            || self.usage().total() > self.budgets.compaction_trigger()
    }

    /// Fold old recent segments into mid, overflowing mid into long, and
    /// re-summarize long if it overflows. Head is never touched.
    pub fn compact(&mut self, summarizer: &dyn Summarizer) -> CompactionReport {
        let tokens_before = self.usage().total();
        let mut report = CompactionReport {
            context_id: self.id,
            tokens_before,
            tokens_after: tokens_before,
            recent_folded: 0,
            mid_folded: 0,
            long_resummarized: false,
        };

        let over_total = tokens_before > self.budgets.compaction_trigger();
        if self.usage[Tier::Recent.index()] > self.budgets.recent || over_total {
            let batch = self.drain_to_watermark(Tier::Recent);
            report.recent_folded = batch.len();
            if let Some(summary) = self.fold(summarizer, &batch, self.budgets.mid) {
                self.push(Tier::Mid, summary);
            }
        }

        if self.usage[Tier::Mid.index()] > self.budgets.mid {
            let batch = self.drain_to_watermark(Tier::Mid);
            report.mid_folded = batch.len();
            if let Some(summary) = self.fold(summarizer, &batch, self.budgets.long) {
                self.push(Tier::Long, summary);
            }
        }

        if self.usage[Tier::Long.index()] > self.budgets.long {
            let i = Tier::Long.index();
            let batch: Vec<_> = self.tiers[i].drain(..).collect();
            self.usage[i] = 0;
            let target = self.watermark(Tier::Long).max(1);
            let text = truncate_to_tokens(&summarizer.summarize(&batch, target), target);
            let tokens = estimate_tokens(&text);
            self.push(Tier::Long, ContextSegment::with_tokens(text, tokens));
            report.long_resummarized = true;
        }

        report.tokens_after = self.usage().total();
        report
    }

    /// Select segments for a worker without exceeding `budget` tokens.
    ///
    /// Head is taken first, then recent newest first, then mid and long.
    pub fn snapshot(&self, budget: usize) -> ContextSnapshot {
        let mut remaining = budget;
        let mut omitted = 0;
        let mut picked: [Vec<ContextSegment>; 4] = Default::default();

        for tier in [Tier::Head, Tier::Recent, Tier::Mid, Tier::Long] {
            let segments = &self.tiers[tier.index()];
            let ordered: Box<dyn Iterator<Item = &ContextSegment>> = if tier == Tier::Head {
                Box::new(segments.iter())
            } else {
                Box::new(segments.iter().rev())
            };
            let mut full = false;
            for segment in ordered {
                if full || segment.tokens > remaining {
                    full = true;
                    omitted += 1;
                    continue;
                }
                remaining -= segment.tokens;
                picked[tier.index()].push(segment.clone());
            }
        }

        let [head, mut recent, mut mid, mut long] = picked;
        recent.reverse();
        mid.reverse();
        long.reverse();
        let segments: Vec<_> = head.into_iter().chain(long).chain(mid).chain(recent).collect();

        ContextSnapshot {
            context_id: Some(self.id),
            budget,
            total_tokens: budget - remaining,
            segments,
            omitted,
        }
    }

    fn push(&mut self, tier: Tier, mut segment: ContextSegment) -> ContextSegment {
        let i = tier.index();
        segment.tier = tier;
        segment.seq = self.next_seq[i];
        self.next_seq[i] += 1;
        self.usage[i] += segment.tokens;
        self.tiers[i].push_back(segment.clone());
        segment
    }

    fn watermark(&self, tier: Tier) -> usize {
        (self.budget(tier) as f64 * self.budgets.low_watermark) as usize
    }

    /// Remove oldest segments until the tier is at or below its low watermark.
    fn drain_to_watermark(&mut self, tier: Tier) -> Vec<ContextSegment> {
        let i = tier.index();
        let target = self.watermark(tier);
        let mut batch = Vec::new();
        while self.usage[i] > target {
            let Some(oldest) = self.tiers[i].pop_front() else {
                break;
            };
            self.usage[i] -= oldest.tokens;
            batch.push(oldest);
        }
        batch
    }

    /// Summarize `batch` into a segment no larger than a quarter of its
    /// tokens and never larger than `cap`.
    fn fold(
        &self,
        summarizer: &dyn Summarizer,
        batch: &[ContextSegment],
        cap: usize,
    ) -> Option<ContextSegment> {
        if batch.is_empty() {
            return None;
        }
        let folded: usize = batch.iter().map(|s| s.tokens).sum();
        let target = ((folded as f64 * SUMMARY_RATIO).ceil() as usize).clamp(1, cap);
        let text = truncate_to_tokens(&summarizer.summarize(batch, target), target);
        let tokens = estimate_tokens(&text);
        Some(ContextSegment::with_tokens(text, tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::ExtractiveSummarizer;

    fn assert_within_budgets(ctx: &TieredContext) {
        for tier in Tier::ALL {
            assert!(
                ctx.usage().get(tier) <= ctx.budget(tier),
                "{tier} over budget: {:?}",
                ctx.usage()
            );
        }
        assert!(ctx.usage().total() <= ctx.budgets.total());
    }

    #[test]
    fn append_45k_into_40k_recent() {
        let mut ctx = TieredContext::new(Uuid::new_v4(), ContextBudgets::default());
        let head = ctx
            .append_head(ContextSegment::new("You are reviewing the payments service."))
            .unwrap();

        let mut compactions = 0;
        for i in 0..45 {
            let segment = ContextSegment::with_tokens(format!("finding {i}: details"), 1_000);
            let (_, report) = ctx.append(&ExtractiveSummarizer, segment);
            if report.is_some() {
                compactions += 1;
            }
            assert_within_budgets(&ctx);
        }

        assert!(compactions >= 1);
        assert!(ctx.usage().recent <= 40_000);
        assert!(ctx.usage().mid > 0);
        let heads: Vec<_> = ctx.segments(Tier::Head).cloned().collect();
        assert_eq!(heads, vec![head]);
    }

    #[test]
    fn oversized_segment_is_clamped() {
        let mut ctx = TieredContext::new(Uuid::new_v4(), ContextBudgets::default());
        ctx.append(&ExtractiveSummarizer, ContextSegment::with_tokens("a", 100));
        let (stored, _) = ctx.append(
            &ExtractiveSummarizer,
            ContextSegment::with_tokens("huge".repeat(50_000), 45_000),
        );
        assert_eq!(stored.tokens, 40_000);
        assert_within_budgets(&ctx);
    }

    #[test]
    fn head_budget_enforced() {
        let budgets = ContextBudgets {
            head: 10,
            ..Default::default()
        };
        let mut ctx = TieredContext::new(Uuid::new_v4(), budgets);
        ctx.append_head(ContextSegment::with_tokens("a", 8)).unwrap();
        let err = ctx
            .append_head(ContextSegment::with_tokens("b", 3))
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::HeadBudgetExceeded {
                tokens: 11,
                budget: 10
            }
        ));
        assert_eq!(ctx.usage().head, 8);
    }

    #[test]
    fn mid_overflow_cascades_to_long() {
        let budgets = ContextBudgets {
            head: 0,
            recent: 100,
            mid: 10,
            long: 10,
            ..Default::default()
        };
        let mut ctx = TieredContext::new(Uuid::new_v4(), budgets);
        for i in 0..200 {
            let text = format!("{i} {}", "lorem ipsum dolor ".repeat(3));
            ctx.append(&ExtractiveSummarizer, ContextSegment::with_tokens(text, 20));
            assert_within_budgets(&ctx);
        }
        assert!(ctx.usage().long > 0);
    }

    #[test]
    fn compact_on_quiet_context_is_noop() {
        let mut ctx = TieredContext::new(Uuid::new_v4(), ContextBudgets::default());
        ctx.append(&ExtractiveSummarizer, ContextSegment::new("hello"));
        let report = ctx.compact(&ExtractiveSummarizer);
        assert!(report.is_noop());
        assert_eq!(report.tokens_before, report.tokens_after);
    }

    #[test]
    fn snapshot_respects_budget_and_order() {
        let mut ctx = TieredContext::new(Uuid::new_v4(), ContextBudgets::default());
        ctx.append_head(ContextSegment::with_tokens("head", 10)).unwrap();
        for i in 0..5 {
            ctx.append(
                &ExtractiveSummarizer,
                ContextSegment::with_tokens(format!("recent {i}"), 10),
            );
        }

        let snap = ctx.snapshot(35);
        assert!(snap.total_tokens <= 35);
        let contents: Vec<_> = snap.segments.iter().map(|s| s.content.as_str()).collect();
        // Head, then the newest recent segments in chronological order.
        assert_eq!(contents, vec!["head", "recent 3", "recent 4"]);
        assert_eq!(snap.omitted, 3);
        assert!(snap.render().starts_with("head\n\nrecent 3"));
    }

    #[test]
    fn zero_budget_snapshot_is_empty() {
        let mut ctx = TieredContext::new(Uuid::new_v4(), ContextBudgets::default());
        ctx.append(&ExtractiveSummarizer, ContextSegment::new("hello"));
        let snap = ctx.snapshot(0);
        assert!(snap.is_empty());
        assert_eq!(snap.omitted, 1);
    }

    #[test]
    fn rebuild_from_segments_continues_sequence() {
        let mut ctx = TieredContext::new(Uuid::new_v4(), ContextBudgets::default());
        ctx.append(&ExtractiveSummarizer, ContextSegment::new("one"));
        ctx.append(&ExtractiveSummarizer, ContextSegment::new("two"));
        let stored: Vec<_> = ctx.segments(Tier::Recent).cloned().rev().collect();

        let mut rebuilt = TieredContext::from_segments(ctx.id(), ContextBudgets::default(), stored);
        assert_eq!(rebuilt.usage(), ctx.usage());
        let (third, _) = rebuilt.append(&ExtractiveSummarizer, ContextSegment::new("three"));
        assert_eq!(third.seq, 2);
        let order: Vec<_> = rebuilt
            .segments(Tier::Recent)
            .map(|s| s.content.as_str())
            .collect();
        assert_eq!(order, vec!["one", "two", "three"]);
    }
}

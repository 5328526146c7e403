//! Context manager for all live contexts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ContextBudgets;
use crate::context::segment::{ContextSegment, Tier};
use crate::context::summarizer::{ExtractiveSummarizer, Summarizer};
use crate::context::tiered::{CompactionReport, ContextSnapshot, TierUsage, TieredContext};
use crate::error::ContextError;
use crate::store::Database;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Default number of contexts kept in memory when backed by a store.
pub const DEFAULT_MAX_RESIDENT: usize = 64;

/// In-memory contexts and their write recency.
#[derive(Default)]
struct Resident {
    contexts: HashMap<Uuid, TieredContext>,
    /// Least recently written first.
    order: VecDeque<Uuid>,
}

impl Resident {
    fn touch(&mut self, id: Uuid) {
        if let Some(pos) = self.order.iter().position(|c| *c == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id);
    }

    fn remove(&mut self, id: Uuid) -> Option<TieredContext> {
        self.order.retain(|c| *c != id);
        self.contexts.remove(&id)
    }
}

/// Owns the live tiered contexts, optionally backed by the store.
///
/// Writes load a context into memory and go to the store before the call
/// returns. With a store attached, at most `max_resident` contexts stay in
/// memory (least recently written are dropped first) and reads of a
/// non-resident context are served from the store without caching it.
pub struct ContextManager {
    budgets: ContextBudgets,
    resident: RwLock<Resident>,
    max_resident: usize,
    summarizer: Arc<dyn Summarizer>,
    store: Option<Arc<dyn Database>>,
    telemetry: Option<TelemetrySink>,
}

impl ContextManager {
    pub fn new(budgets: ContextBudgets) -> Result<Self, ContextError> {
        budgets
            .validate()
            .map_err(|e| ContextError::InvalidBudgets(e.to_string()))?;
        Ok(Self {
            budgets,
            resident: RwLock::new(Resident::default()),
            max_resident: DEFAULT_MAX_RESIDENT,
            summarizer: Arc::new(ExtractiveSummarizer),
            store: None,
            telemetry: None,
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Database>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Cap on in-memory contexts. Only enforced when a store is attached,
    /// since without one memory is the only copy.
    pub fn with_max_resident(mut self, max_resident: usize) -> Self {
        self.max_resident = max_resident.max(1);
        self
    }

    pub fn budgets(&self) -> ContextBudgets {
        self.budgets
    }

    /// Start an empty context.
    pub async fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        let mut resident = self.resident.write().await;
        resident.contexts.insert(id, TieredContext::new(id, self.budgets));
        resident.touch(id);
        self.trim(&mut resident, id);
        id
    }

    /// Bring a context into memory from the store if it is not already there.
    pub async fn load(&self, id: Uuid) -> Result<(), ContextError> {
        let mut resident = self.resident.write().await;
        self.ensure_loaded(&mut resident, id).await?;
        Ok(())
    }

    /// Pin framing in the head tier.
    pub async fn append_head(
        &self,
        id: Uuid,
        segment: ContextSegment,
    ) -> Result<ContextSegment, ContextError> {
        let mut resident = self.resident.write().await;
        let ctx = self.ensure_loaded(&mut resident, id).await?;
        let stored = ctx.append_head(segment)?;
        if let Some(ref store) = self.store {
            store.insert_context_segment(id, &stored).await?;
        }
        Ok(stored)
    }

    /// Append to the recent tier, compacting when budgets require it.
    pub async fn append(
        &self,
        id: Uuid,
        segment: ContextSegment,
    ) -> Result<Option<CompactionReport>, ContextError> {
        let mut resident = self.resident.write().await;
        let ctx = self.ensure_loaded(&mut resident, id).await?;

        let (stored, report) = ctx.append(self.summarizer.as_ref(), segment);
        match report {
            Some(ref report) if !report.is_noop() => {
                self.persist_compacted(ctx).await?;
                self.announce(report);
            }
            _ => {
                if let Some(ref store) = self.store {
                    store.insert_context_segment(id, &stored).await?;
                }
            }
        }
        Ok(report)
    }

    /// Run compaction now regardless of thresholds.
    pub async fn compact(&self, id: Uuid) -> Result<CompactionReport, ContextError> {
        let mut resident = self.resident.write().await;
        let ctx = self.ensure_loaded(&mut resident, id).await?;

        let report = ctx.compact(self.summarizer.as_ref());
        if !report.is_noop() {
            self.persist_compacted(ctx).await?;
            self.announce(&report);
        }
        Ok(report)
    }

    /// Budget-bounded view of a context. Unknown contexts yield an empty snapshot.
    pub async fn snapshot(&self, id: Uuid, budget: usize) -> Result<ContextSnapshot, ContextError> {
        Ok(self
            .read(id, |ctx| ctx.snapshot(budget))
            .await?
            .unwrap_or_else(|| ContextSnapshot::empty(budget)))
    }

    pub async fn usage(&self, id: Uuid) -> Result<TierUsage, ContextError> {
        Ok(self.read(id, |ctx| ctx.usage()).await?.unwrap_or_default())
    }

    /// Drop a context from memory; it stays in the store.
    pub async fn evict(&self, id: Uuid) -> bool {
        self.resident.write().await.remove(id).is_some()
    }

    /// Drop a context from memory and the store.
    pub async fn remove(&self, id: Uuid) -> Result<(), ContextError> {
        self.resident.write().await.remove(id);
        if let Some(ref store) = self.store {
            let removed = store.delete_context(id).await?;
            tracing::debug!(context_id = %id, removed, "Context removed");
        }
        Ok(())
    }

    /// Number of contexts held in memory.
    pub async fn resident_count(&self) -> usize {
        self.resident.read().await.contexts.len()
    }

    /// Apply `f` to the resident copy, or to a transient copy rebuilt from
    /// the store. `None` if the context exists nowhere.
    async fn read<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&TieredContext) -> T,
    ) -> Result<Option<T>, ContextError> {
        {
            let resident = self.resident.read().await;
            if let Some(ctx) = resident.contexts.get(&id) {
                return Ok(Some(f(ctx)));
            }
        }
        let Some(ref store) = self.store else {
            return Ok(None);
        };
        let segments = store.list_context_segments(id, None).await?;
        if segments.is_empty() {
            return Ok(None);
        }
        let ctx = TieredContext::from_segments(id, self.budgets, segments);
        Ok(Some(f(&ctx)))
    }

    async fn ensure_loaded<'a>(
        &self,
        resident: &'a mut Resident,
        id: Uuid,
    ) -> Result<&'a mut TieredContext, ContextError> {
        if !resident.contexts.contains_key(&id) {
            let ctx = match self.store {
                Some(ref store) => {
                    let segments = store.list_context_segments(id, None).await?;
                    if !segments.is_empty() {
                        tracing::debug!(context_id = %id, segments = segments.len(), "Context loaded");
                    }
                    TieredContext::from_segments(id, self.budgets, segments)
                }
                None => TieredContext::new(id, self.budgets),
            };
            resident.contexts.insert(id, ctx);
        }
        resident.touch(id);
        self.trim(resident, id);
        Ok(resident
            .contexts
            .entry(id)
            .or_insert_with(|| TieredContext::new(id, self.budgets)))
    }

    /// Drop least recently written contexts beyond the cap, never `keep`.
    fn trim(&self, resident: &mut Resident, keep: Uuid) {
        if self.store.is_none() {
            return;
        }
        while resident.contexts.len() > self.max_resident {
            let Some(victim) = resident.order.iter().copied().find(|c| *c != keep) else {
                break;
            };
            resident.remove(victim);
            tracing::debug!(context_id = %victim, "Context evicted from memory");
        }
    }

    /// Compaction rewrites every tier except head.
    async fn persist_compacted(&self, ctx: &TieredContext) -> Result<(), ContextError> {
        let Some(ref store) = self.store else {
            return Ok(());
        };
        for tier in [Tier::Recent, Tier::Mid, Tier::Long] {
            let segments: Vec<_> = ctx.segments(tier).cloned().collect();
            store.replace_context_tier(ctx.id(), tier, &segments).await?;
        }
        Ok(())
    }

    fn announce(&self, report: &CompactionReport) {
        tracing::info!(
            context_id = %report.context_id,
            before = report.tokens_before,
            after = report.tokens_after,
            recent_folded = report.recent_folded,
            mid_folded = report.mid_folded,
            "Context compacted"
        );
        if let Some(ref telemetry) = self.telemetry {
            telemetry.emit(TelemetryEvent::Compaction(report.clone()));
        }
    }
}

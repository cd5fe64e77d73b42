//! No-op memory store — disables long-term memory entirely.

use async_trait::async_trait;
use snapclaw_core::error::MemoryError;
use snapclaw_core::memory::{FactsSnapshot, HistoryEntry, MemoryFact, MemoryStore, MergeReport};
use snapclaw_core::session::SessionKey;

/// A memory store that remembers nothing.
pub struct NoopMemory;

#[async_trait]
impl MemoryStore for NoopMemory {
    fn name(&self) -> &str { "none" }

    async fn upsert_facts(&self, _session: &SessionKey, _facts: Vec<MemoryFact>) -> Result<MergeReport, MemoryError> {
        Ok(MergeReport::default())
    }

    async fn append_history(&self, _session: &SessionKey, _entry: HistoryEntry) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn load_facts_snapshot(&self, _session: &SessionKey) -> Result<FactsSnapshot, MemoryError> {
        Ok(FactsSnapshot::default())
    }

    async fn load_recent_history(&self, _session: &SessionKey, _limit: usize) -> Result<Vec<HistoryEntry>, MemoryError> {
        Ok(Vec::new())
    }
}

//! In-memory implementation of all three store traits.
//!
//! Same uniqueness rules as Postgres (one item per url, one running run), so
//! the engine behaves identically against either. Backs tests and local runs
//! without `DATABASE_URL`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use inflow_common::{
    EnrichedFields, Item, LedgerEntry, Run, RunCounters, RunStatus, SourceConfig, SourceKind,
};

use crate::error::{StoreError, StoreResult};
use crate::traits::{ItemStore, RunLedger, SourceRegistry};

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, Item>,
    url_index: HashMap<String, Uuid>,
    runs: HashMap<Uuid, Run>,
    ledger: Vec<LedgerEntry>,
    sources: HashMap<String, SourceConfig>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: impl IntoIterator<Item = SourceConfig>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for source in sources {
                inner.sources.insert(source.name.clone(), source);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Inspection helpers ---

    pub fn items(&self) -> Vec<Item> {
        self.lock().items.values().cloned().collect()
    }

    pub fn item_by_url(&self, url: &str) -> Option<Item> {
        let inner = self.lock();
        inner
            .url_index
            .get(url)
            .and_then(|id| inner.items.get(id))
            .cloned()
    }

    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.lock().ledger.clone()
    }

    pub fn source(&self, name: &str) -> Option<SourceConfig> {
        self.lock().sources.get(name).cloned()
    }

    /// Seed a run row directly, bypassing the single-running check.
    pub fn seed_run(&self, run: Run) {
        self.lock().runs.insert(run.id, run);
    }

    /// Seed an item directly (e.g. a row that predates the run under test).
    pub fn seed_item(&self, item: Item) {
        let mut inner = self.lock();
        inner.url_index.insert(item.url.clone(), item.id);
        inner.items.insert(item.id, item);
    }
}

fn newest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn find_by_url(&self, url: &str) -> StoreResult<Option<Item>> {
        Ok(self.item_by_url(url))
    }

    async fn find_by_urls(&self, urls: &[String]) -> StoreResult<Vec<Item>> {
        let inner = self.lock();
        Ok(urls
            .iter()
            .filter_map(|u| inner.url_index.get(u))
            .filter_map(|id| inner.items.get(id))
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: Uuid) -> StoreResult<Option<Item>> {
        Ok(self.lock().items.get(&id).cloned())
    }

    async fn insert_item(&self, item: &Item) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.url_index.contains_key(&item.url) {
            return Err(StoreError::UniqueViolation {
                url: item.url.clone(),
            });
        }
        inner.url_index.insert(item.url.clone(), item.id);
        inner.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn merge_item(&self, item: &Item) -> StoreResult<()> {
        let mut inner = self.lock();
        let existing = inner
            .items
            .get_mut(&item.id)
            .ok_or_else(|| StoreError::NotFound(format!("item {}", item.id)))?;
        existing.title = item.title.clone();
        // Stored content only ever grows; blank counts as empty.
        if trimmed_len(&item.content) > trimmed_len(&existing.content) {
            existing.content = item.content.clone();
        }
        existing.author = item.author.clone();
        existing.published_at = item.published_at;
        existing.source_name = item.source_name.clone();
        existing.metadata = item.metadata.clone();
        existing.updated_at = item.updated_at;
        Ok(())
    }

    async fn unenriched_among(&self, ids: &[Uuid]) -> StoreResult<Vec<Item>> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.items.get(id))
            .filter(|i| !i.is_enriched && i.has_content())
            .cloned()
            .collect())
    }

    async fn unenriched_for_source(&self, source_name: &str, limit: i64) -> StoreResult<Vec<Item>> {
        let inner = self.lock();
        let mut backlog: Vec<Item> = inner
            .items
            .values()
            .filter(|i| i.source_name == source_name && !i.is_enriched && i.has_content())
            .cloned()
            .collect();
        backlog.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        backlog.truncate(limit.max(0) as usize);
        Ok(backlog)
    }

    async fn apply_enrichment(
        &self,
        id: Uuid,
        fields: &EnrichedFields,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let item = inner
            .items
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("item {id}")))?;
        if item.is_enriched {
            return Ok(false);
        }
        item.summary = Some(fields.summary.clone());
        item.tags = fields.tags.clone();
        item.importance = Some(fields.importance);
        item.category = fields.category.clone().or(item.category.take());
        item.is_enriched = true;
        item.enriched_at = Some(at);
        item.updated_at = at;
        Ok(true)
    }

    async fn count_items(&self) -> StoreResult<i64> {
        Ok(self.lock().items.len() as i64)
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn create_run(&self, run: &Run) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.runs.values().any(|r| r.status == RunStatus::Running) {
            return Err(StoreError::RunningRunExists);
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_counters(&self, run_id: Uuid, counters: &RunCounters) -> StoreResult<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        run.counters = counters.clone();
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<&str>,
        counters: &RunCounters,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = status;
        run.error_message = error_message.map(str::to_string);
        run.counters = counters.clone();
        run.completed_at = Some(at);
        Ok(true)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn latest_run(&self) -> StoreResult<Option<Run>> {
        Ok(self.list_runs(1).await?.into_iter().next())
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self.lock().runs.values().cloned().collect();
        newest_first(&mut runs);
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn running_runs(&self) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .lock()
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect();
        newest_first(&mut runs);
        Ok(runs)
    }

    async fn mark_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let mut inner = self.lock();
        let mut relabelled = Vec::new();
        for run in inner.runs.values_mut() {
            if run.status == RunStatus::Running && run.started_at < cutoff {
                run.status = RunStatus::Error;
                run.error_message = Some(message.to_string());
                run.completed_at = Some(at);
                relabelled.push(run.id);
            }
        }
        Ok(relabelled)
    }

    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        self.lock().ledger.push(entry.clone());
        Ok(())
    }

    async fn entries_for_run(&self, run_id: Uuid) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()
            .ledger
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn latest_entries_per_source(&self) -> StoreResult<Vec<LedgerEntry>> {
        let inner = self.lock();
        let mut latest: HashMap<&str, &LedgerEntry> = HashMap::new();
        for entry in &inner.ledger {
            match latest.get(entry.source_name.as_str()) {
                Some(prev) if prev.completed_at > entry.completed_at => {}
                _ => {
                    latest.insert(entry.source_name.as_str(), entry);
                }
            }
        }
        let mut entries: Vec<LedgerEntry> = latest.into_values().cloned().collect();
        entries.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        Ok(entries)
    }
}

#[async_trait]
impl SourceRegistry for MemoryStore {
    async fn enabled_sources(&self, kind: SourceKind) -> StoreResult<Vec<SourceConfig>> {
        let mut sources: Vec<SourceConfig> = self
            .lock()
            .sources
            .values()
            .filter(|s| s.enabled && s.kind == kind)
            .cloned()
            .collect();
        sources.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(sources)
    }

    async fn all_sources(&self) -> StoreResult<Vec<SourceConfig>> {
        let mut sources: Vec<SourceConfig> = self.lock().sources.values().cloned().collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn register_source(&self, source: &SourceConfig) -> StoreResult<()> {
        self.lock()
            .sources
            .insert(source.name.clone(), source.clone());
        Ok(())
    }

    async fn record_success(
        &self,
        name: &str,
        item_count: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let source = inner
            .sources
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("source {name}")))?;
        source.last_collected_at = Some(at);
        source.total_items_collected += i64::from(item_count);
        source.last_error = None;
        Ok(())
    }

    async fn record_failure(&self, name: &str, message: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let source = inner
            .sources
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("source {name}")))?;
        source.last_error = Some(message.to_string());
        Ok(())
    }
}

fn trimmed_len(content: &Option<String>) -> usize {
    content.as_deref().map_or(0, |c| c.trim().chars().count())
}

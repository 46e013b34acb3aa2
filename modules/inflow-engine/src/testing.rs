// Test mocks for the engine.
//
// One mock per collaborator seam:
// - MockAdapter (FetchAdapter): per-source canned results, failures, panics, gates
// - MockContentFetcher (ContentFetcher): HashMap url -> page text
// - CountingEnrichment (EnrichmentService): counts handles issued and calls made
// - RecordingNotifier (RunNotifier): keeps every notification, optionally fails
//
// Plus store wrappers that misbehave on purpose:
// - RacingItemStore: loses the first insert of each contested url
// - ContestedItemStore: never sees an existing row yet every insert collides
// - BrokenSourceRegistry: listing enabled sources always errors
// and small builders for sources, candidates, and engine wiring.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use inflow_common::{
    CandidateItem, EnrichedFields, EnrichmentRequest, Item, SourceConfig, SourceKind,
};
use inflow_store::{ItemStore, MemoryStore, SourceRegistry, StoreError, StoreResult};

use crate::control::{EngineDeps, RunControl};
use crate::notify::{NotifyError, RunNotification, RunNotifier};
use crate::settings::EngineSettings;
use crate::traits::{AdapterSet, ContentFetcher, Enricher, EnrichmentService, FetchAdapter};

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

enum Canned {
    Items(Vec<CandidateItem>),
    Fail(String),
    Panic,
}

#[derive(Clone)]
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// Source-name keyed adapter. Unregistered sources return no candidates.
#[derive(Default)]
pub struct MockAdapter {
    canned: HashMap<String, Canned>,
    invalid: HashMap<String, String>,
    gates: HashMap<String, Gate>,
    calls: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, source: &str, items: Vec<CandidateItem>) -> Self {
        self.canned.insert(source.to_string(), Canned::Items(items));
        self
    }

    pub fn failing(mut self, source: &str, message: &str) -> Self {
        self.canned.insert(source.to_string(), Canned::Fail(message.to_string()));
        self
    }

    pub fn panicking(mut self, source: &str) -> Self {
        self.canned.insert(source.to_string(), Canned::Panic);
        self
    }

    pub fn invalid(mut self, source: &str, message: &str) -> Self {
        self.invalid.insert(source.to_string(), message.to_string());
        self
    }

    /// `fetch` for `source` signals `entered`, then waits for `release`.
    pub fn gated(mut self, source: &str, entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gates
            .insert(source.to_string(), Gate { entered, release });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, source: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|s| *s == source).count()
    }
}

#[async_trait]
impl FetchAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn validate(&self, source: &SourceConfig) -> std::result::Result<(), String> {
        match self.invalid.get(&source.name) {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<CandidateItem>> {
        self.calls.lock().unwrap().push(source.name.clone());

        if let Some(gate) = self.gates.get(&source.name).cloned() {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        match self.canned.get(&source.name) {
            Some(Canned::Items(items)) => Ok(items.clone()),
            Some(Canned::Fail(message)) => Err(anyhow!("{message}")),
            Some(Canned::Panic) => panic!("adapter blew up for {}", source.name),
            None => Ok(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockContentFetcher
// ---------------------------------------------------------------------------

/// HashMap-based page fetcher. Returns `Err` for unregistered urls.
#[derive(Default)]
pub struct MockContentFetcher {
    pages: HashMap<String, String>,
    calls: AtomicUsize,
}

impl MockContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentFetcher for MockContentFetcher {
    async fn fetch_content(&self, url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("MockContentFetcher: no page registered for {url}"))
    }
}

// ---------------------------------------------------------------------------
// CountingEnrichment
// ---------------------------------------------------------------------------

/// Deterministic enrichment that counts handles and calls. Titles registered
/// with `failing_for` make the call fail.
#[derive(Default)]
pub struct CountingEnrichment {
    handles: AtomicUsize,
    calls: Arc<AtomicUsize>,
    failing_titles: Arc<HashSet<String>>,
}

impl CountingEnrichment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(titles: &[&str]) -> Self {
        Self {
            failing_titles: Arc::new(titles.iter().map(|t| t.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EnrichmentService for CountingEnrichment {
    fn handle(&self) -> Box<dyn Enricher> {
        self.handles.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingEnricher {
            calls: self.calls.clone(),
            failing_titles: self.failing_titles.clone(),
        })
    }
}

struct CountingEnricher {
    calls: Arc<AtomicUsize>,
    failing_titles: Arc<HashSet<String>>,
}

#[async_trait]
impl Enricher for CountingEnricher {
    async fn enrich(&self, request: EnrichmentRequest) -> Result<EnrichedFields> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_titles.contains(&request.title) {
            return Err(anyhow!("model refused: {}", request.title));
        }
        Ok(EnrichedFields {
            summary: format!("Summary of {}", request.title),
            tags: vec![request.source_name.clone()],
            importance: 5,
            category: None,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<RunNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the attempt, then fails delivery.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<RunNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunNotifier for RecordingNotifier {
    async fn notify(&self, notification: &RunNotification) -> std::result::Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(NotifyError::Config("webhook unreachable".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RacingItemStore
// ---------------------------------------------------------------------------

/// Wraps a MemoryStore. The first insert of each contested url finds that a
/// competitor row (with `competitor_content`) landed just before it.
pub struct RacingItemStore {
    inner: Arc<MemoryStore>,
    contested: Mutex<HashSet<String>>,
    competitor_content: String,
}

impl RacingItemStore {
    pub fn new(inner: Arc<MemoryStore>, urls: &[&str], competitor_content: &str) -> Self {
        Self {
            inner,
            contested: Mutex::new(urls.iter().map(|u| u.to_string()).collect()),
            competitor_content: competitor_content.to_string(),
        }
    }
}

#[async_trait]
impl ItemStore for RacingItemStore {
    async fn find_by_url(&self, url: &str) -> StoreResult<Option<Item>> {
        self.inner.find_by_url(url).await
    }

    async fn find_by_urls(&self, urls: &[String]) -> StoreResult<Vec<Item>> {
        self.inner.find_by_urls(urls).await
    }

    async fn get_item(&self, id: Uuid) -> StoreResult<Option<Item>> {
        self.inner.get_item(id).await
    }

    async fn insert_item(&self, item: &Item) -> StoreResult<()> {
        let contested = self.contested.lock().unwrap().remove(&item.url);
        if contested {
            let rival = CandidateItem::new("competitor", &item.url)
                .with_content(self.competitor_content.clone());
            self.inner
                .insert_item(&Item::from_candidate(&rival, "competitor", Utc::now()))
                .await?;
        }
        self.inner.insert_item(item).await
    }

    async fn merge_item(&self, item: &Item) -> StoreResult<()> {
        self.inner.merge_item(item).await
    }

    async fn unenriched_among(&self, ids: &[Uuid]) -> StoreResult<Vec<Item>> {
        self.inner.unenriched_among(ids).await
    }

    async fn unenriched_for_source(&self, source_name: &str, limit: i64) -> StoreResult<Vec<Item>> {
        self.inner.unenriched_for_source(source_name, limit).await
    }

    async fn apply_enrichment(
        &self,
        id: Uuid,
        fields: &EnrichedFields,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.apply_enrichment(id, fields, at).await
    }

    async fn count_items(&self) -> StoreResult<i64> {
        self.inner.count_items().await
    }
}

// ---------------------------------------------------------------------------
// ContestedItemStore
// ---------------------------------------------------------------------------

/// Wraps a MemoryStore. Lookups never find a row and every insert reports a
/// unique violation, so each upsert exhausts its attempts.
pub struct ContestedItemStore {
    inner: Arc<MemoryStore>,
    inserts: AtomicUsize,
}

impl ContestedItemStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            inserts: AtomicUsize::new(0),
        }
    }

    pub fn insert_attempts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemStore for ContestedItemStore {
    async fn find_by_url(&self, _url: &str) -> StoreResult<Option<Item>> {
        Ok(None)
    }

    async fn find_by_urls(&self, _urls: &[String]) -> StoreResult<Vec<Item>> {
        Ok(Vec::new())
    }

    async fn get_item(&self, id: Uuid) -> StoreResult<Option<Item>> {
        self.inner.get_item(id).await
    }

    async fn insert_item(&self, item: &Item) -> StoreResult<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::UniqueViolation {
            url: item.url.clone(),
        })
    }

    async fn merge_item(&self, item: &Item) -> StoreResult<()> {
        self.inner.merge_item(item).await
    }

    async fn unenriched_among(&self, ids: &[Uuid]) -> StoreResult<Vec<Item>> {
        self.inner.unenriched_among(ids).await
    }

    async fn unenriched_for_source(&self, source_name: &str, limit: i64) -> StoreResult<Vec<Item>> {
        self.inner.unenriched_for_source(source_name, limit).await
    }

    async fn apply_enrichment(
        &self,
        id: Uuid,
        fields: &EnrichedFields,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.apply_enrichment(id, fields, at).await
    }

    async fn count_items(&self) -> StoreResult<i64> {
        self.inner.count_items().await
    }
}

// ---------------------------------------------------------------------------
// BrokenSourceRegistry
// ---------------------------------------------------------------------------

/// Wraps a MemoryStore whose enabled-source listing always fails.
pub struct BrokenSourceRegistry {
    inner: Arc<MemoryStore>,
    message: String,
}

impl BrokenSourceRegistry {
    pub fn new(inner: Arc<MemoryStore>, message: &str) -> Self {
        Self {
            inner,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl SourceRegistry for BrokenSourceRegistry {
    async fn enabled_sources(&self, _kind: SourceKind) -> StoreResult<Vec<SourceConfig>> {
        Err(StoreError::Decode(self.message.clone()))
    }

    async fn all_sources(&self) -> StoreResult<Vec<SourceConfig>> {
        self.inner.all_sources().await
    }

    async fn register_source(&self, source: &SourceConfig) -> StoreResult<()> {
        self.inner.register_source(source).await
    }

    async fn record_success(
        &self,
        name: &str,
        item_count: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.record_success(name, item_count, at).await
    }

    async fn record_failure(&self, name: &str, message: &str) -> StoreResult<()> {
        self.inner.record_failure(name, message).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn feed_source(name: &str) -> SourceConfig {
    SourceConfig::new(name, SourceKind::Feed).with_url(format!("https://{name}.example/rss"))
}

/// Candidate at `url` with `content_len` chars of body (none when zero).
pub fn candidate(url: &str, content_len: usize) -> CandidateItem {
    let c = CandidateItem::new(format!("Item {url}"), url);
    if content_len == 0 {
        c
    } else {
        c.with_content("x".repeat(content_len))
    }
}

/// Settings with tiny backoff so race tests stay fast.
pub fn fast_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.upsert.base_backoff = Duration::from_millis(1);
    settings
}

/// The same adapter registered for every source kind.
pub fn adapters_for_all(adapter: Arc<dyn FetchAdapter>) -> AdapterSet {
    SourceKind::PHASE_ORDER
        .into_iter()
        .fold(AdapterSet::new(), |set, kind| set.with(kind, adapter.clone()))
}

/// RunControl over a MemoryStore with the given adapter and enrichment.
pub fn memory_control(
    store: Arc<MemoryStore>,
    adapter: Arc<MockAdapter>,
    enrichment: Option<Arc<CountingEnrichment>>,
    settings: EngineSettings,
) -> RunControl {
    let mut deps = EngineDeps::from_store(
        store,
        adapters_for_all(adapter),
        Arc::new(MockContentFetcher::new()),
    );
    if let Some(service) = enrichment {
        deps = deps.with_enrichment(service);
    }
    RunControl::new(deps, settings)
}

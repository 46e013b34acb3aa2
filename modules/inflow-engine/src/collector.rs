//! Process-one-source routine.
//!
//! fetch -> classify -> fill missing content (tier 2) -> upsert ->
//! enrich what is still unenriched (tier 2) -> bookkeeping + ledger entry.
//!
//! Every failure below the source level is absorbed here. A source either
//! produces a successful outcome or a failed one with a message; it never
//! returns an error to the phase driver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use inflow_common::{
    CandidateItem, EnrichmentRequest, IngestError, Item, LedgerEntry, SourceConfig, SourceOutcome,
};
use inflow_store::{ItemStore, RunLedger, SourceRegistry, StoreResult};

use crate::classify::{classify, normalize};
use crate::registry::{Checkpoint, StopToken};
use crate::settings::EngineSettings;
use crate::traits::{AdapterSet, ContentFetcher, EnrichmentService};
use crate::upsert::upsert_candidate;

/// Everything one run needs to process sources. Built once per run and
/// shared by all of that run's source tasks.
pub struct SourceCollector {
    pub(crate) run_id: Uuid,
    pub(crate) items: Arc<dyn ItemStore>,
    pub(crate) ledger: Arc<dyn RunLedger>,
    pub(crate) sources: Arc<dyn SourceRegistry>,
    pub(crate) adapters: AdapterSet,
    pub(crate) content: Arc<dyn ContentFetcher>,
    /// `None` when the run was admitted with enrichment disabled.
    pub(crate) enrichment: Option<Arc<dyn EnrichmentService>>,
    pub(crate) settings: Arc<EngineSettings>,
    pub(crate) token: StopToken,
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl SourceCollector {
    /// Process one source end to end. `None` means the run was stopping before
    /// the source started, so it was skipped and left no trace.
    pub async fn process(&self, source: &SourceConfig) -> Option<SourceOutcome> {
        if self.token.check(Checkpoint::BeforeSource) {
            info!(source = %source.name, "Skipping source, run is stopping");
            return None;
        }

        let started_at = Utc::now();
        let outcome = match self.collect(source).await {
            Ok(outcome) => outcome,
            Err(message) => SourceOutcome::failed(source, message),
        };
        self.record(source, &outcome, started_at).await;
        Some(outcome)
    }

    /// Source bookkeeping plus one ledger entry. Write failures are logged only.
    pub(crate) async fn record(
        &self,
        source: &SourceConfig,
        outcome: &SourceOutcome,
        started_at: DateTime<Utc>,
    ) {
        if outcome.success {
            info!(
                source = %source.name,
                items = outcome.total_items,
                new = outcome.new_items,
                updated = outcome.updated_items,
                enriched = outcome.enriched_count,
                "Source complete"
            );
            if let Err(e) = self
                .sources
                .record_success(&source.name, outcome.total_items, Utc::now())
                .await
            {
                warn!(source = %source.name, error = %e, "Failed to record source success");
            }
        } else {
            let message = outcome.error.as_deref().unwrap_or("unknown error");
            warn!(source = %source.name, error = message, "Source failed");
            if let Err(e) = self.sources.record_failure(&source.name, message).await {
                warn!(source = %source.name, error = %e, "Failed to record source failure");
            }
        }

        let entry = LedgerEntry::from_outcome(self.run_id, outcome, started_at);
        if let Err(e) = self.ledger.append_entry(&entry).await {
            warn!(source = %source.name, error = %e, "Failed to append ledger entry");
        }
    }

    async fn collect(&self, source: &SourceConfig) -> Result<SourceOutcome, String> {
        let candidates = self.fetch_candidates(source).await?;
        let total_items = count(candidates.len());

        let normalized = normalize(candidates);
        let urls: Vec<String> = normalized.iter().map(|c| c.url.clone()).collect();
        let stored: HashMap<String, Item> = self
            .items
            .find_by_urls(&urls)
            .await
            .map_err(|e| format!("item lookup failed: {e}"))?
            .into_iter()
            .map(|item| (item.url.clone(), item))
            .collect();
        let classified = classify(normalized, &stored);
        debug!(
            source = %source.name,
            fetched = total_items,
            skip = classified.skip.len(),
            need_content = classified.need_content.len(),
            ready = classified.ready.len(),
            "Classified candidates"
        );

        let mut stopping = false;
        let mut to_upsert = classified.ready;
        if !classified.need_content.is_empty() {
            if self.token.check(Checkpoint::BeforeContentFetch) {
                stopping = true;
                to_upsert.extend(classified.need_content);
            } else {
                to_upsert.extend(self.fill_content(source, classified.need_content).await);
            }
        }

        let mut new_items = 0u32;
        let mut updated_items = 0u32;
        let mut upserted = Vec::with_capacity(to_upsert.len());
        for candidate in &to_upsert {
            match upsert_candidate(
                self.items.as_ref(),
                candidate,
                &source.name,
                &self.settings.upsert,
            )
            .await
            {
                Ok(result) => {
                    if result.is_new {
                        new_items += 1;
                    } else {
                        updated_items += 1;
                    }
                    upserted.push(result.id);
                }
                Err(e) => {
                    warn!(source = %source.name, url = %candidate.url, error = %e, "Upsert failed, item skipped");
                }
            }
        }

        let enriched_count = match &self.enrichment {
            Some(service) if !stopping && !self.token.check(Checkpoint::BeforeEnrichment) => {
                self.enrich(service, source, &upserted).await
            }
            _ => 0,
        };

        Ok(SourceOutcome {
            source_name: source.name.clone(),
            kind: source.kind,
            total_items,
            new_items,
            updated_items,
            enriched_count,
            success: true,
            error: None,
        })
    }

    async fn fetch_candidates(&self, source: &SourceConfig) -> Result<Vec<CandidateItem>, String> {
        let adapter = self
            .adapters
            .get(source.kind)
            .ok_or_else(|| format!("no fetch adapter registered for kind {}", source.kind))?;

        adapter
            .validate(source)
            .map_err(|e| format!("invalid source configuration: {e}"))?;

        debug!(source = %source.name, adapter = adapter.name(), "Fetching candidates");
        match timeout(self.settings.adapter_timeout, adapter.fetch(source)).await {
            Ok(Ok(candidates)) => Ok(candidates),
            Ok(Err(e)) => Err(IngestError::adapter(&source.name, format!("{e:#}")).to_string()),
            Err(_) => Err(IngestError::adapter(
                &source.name,
                format!("timed out after {}s", self.settings.adapter_timeout.as_secs()),
            )
            .to_string()),
        }
    }

    /// Tier 2: fetch content for candidates that have none. A failed fetch
    /// leaves the candidate as it was.
    async fn fill_content(
        &self,
        source: &SourceConfig,
        candidates: Vec<CandidateItem>,
    ) -> Vec<CandidateItem> {
        info!(source = %source.name, count = candidates.len(), "Fetching missing content");
        let content = self.content.clone();
        let limit = self.settings.content_fetch_timeout;
        let source_name = source.name.clone();

        stream::iter(candidates.into_iter().map(move |candidate| {
            fill_one(content.clone(), limit, source_name.clone(), candidate)
        }))
        .buffer_unordered(self.settings.fetch_workers)
        .collect()
        .await
    }

    /// Items this pass should enrich: the just-upserted ids re-checked against
    /// the store, plus the source's older unenriched backlog.
    async fn enrichment_targets(&self, source: &SourceConfig, upserted: &[Uuid]) -> StoreResult<Vec<Item>> {
        let mut targets = self.items.unenriched_among(upserted).await?;
        if self.settings.backlog_limit > 0 {
            let backlog = self
                .items
                .unenriched_for_source(&source.name, self.settings.backlog_limit)
                .await?;
            let mut seen: HashSet<Uuid> = targets.iter().map(|item| item.id).collect();
            targets.extend(backlog.into_iter().filter(|item| seen.insert(item.id)));
        }
        Ok(targets)
    }

    /// Tier 2: enrich concurrently, one fresh enricher handle per call.
    async fn enrich(
        &self,
        service: &Arc<dyn EnrichmentService>,
        source: &SourceConfig,
        upserted: &[Uuid],
    ) -> u32 {
        let targets = match self.enrichment_targets(source, upserted).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(source = %source.name, error = %e, "Could not load enrichment targets");
                return 0;
            }
        };
        if targets.is_empty() {
            return 0;
        }
        info!(source = %source.name, count = targets.len(), "Enriching items");

        let items = self.items.clone();
        let service = service.clone();
        let settings = self.settings.clone();
        let applied: Vec<bool> = stream::iter(targets.into_iter().map(move |item| {
            enrich_one(items.clone(), service.clone(), settings.clone(), item)
        }))
        .buffer_unordered(self.settings.enrich_workers)
        .collect()
        .await;

        count(applied.into_iter().filter(|ok| *ok).count())
    }
}

async fn fill_one(
    content: Arc<dyn ContentFetcher>,
    limit: Duration,
    source_name: String,
    mut candidate: CandidateItem,
) -> CandidateItem {
    match timeout(limit, content.fetch_content(&candidate.url)).await {
        Ok(Ok(text)) if !text.trim().is_empty() => candidate.raw_content = Some(text),
        Ok(Ok(_)) => debug!(source = %source_name, url = %candidate.url, "Fetched page had no text"),
        Ok(Err(e)) => {
            warn!(source = %source_name, url = %candidate.url, error = %e, "Content fetch failed")
        }
        Err(_) => warn!(source = %source_name, url = %candidate.url, "Content fetch timed out"),
    }
    candidate
}

/// One enrichment call on a fresh handle. True when the fields were stored.
async fn enrich_one(
    items: Arc<dyn ItemStore>,
    service: Arc<dyn EnrichmentService>,
    settings: Arc<EngineSettings>,
    item: Item,
) -> bool {
    let enricher = service.handle();
    let request = EnrichmentRequest::for_item(&item, settings.custom_prompt.clone());

    let fields = match timeout(settings.enrich_timeout, enricher.enrich(request)).await {
        Ok(Ok(fields)) => fields,
        Ok(Err(e)) => {
            warn!(url = %item.url, error = %e, "Enrichment failed");
            return false;
        }
        Err(_) => {
            warn!(url = %item.url, "Enrichment timed out");
            return false;
        }
    };

    match items.apply_enrichment(item.id, &fields, Utc::now()).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(url = %item.url, "Item already enriched by another run");
            false
        }
        Err(e) => {
            warn!(url = %item.url, error = %e, "Failed to store enrichment");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RunRegistry;
    use crate::testing::*;
    use crate::traits::FetchAdapter;
    use inflow_common::{LedgerStatus, SourceKind};
    use inflow_store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<RunRegistry>,
        collector: SourceCollector,
    }

    fn harness(
        adapters: AdapterSet,
        content: MockContentFetcher,
        enrichment: Option<Arc<CountingEnrichment>>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
        let registry = Arc::new(RunRegistry::new());
        let run_id = Uuid::new_v4();
        registry.begin(run_id).unwrap();
        let collector = SourceCollector {
            run_id,
            items: store.clone(),
            ledger: store.clone(),
            sources: store.clone(),
            adapters,
            content: Arc::new(content),
            enrichment: enrichment.map(|e| e as Arc<dyn EnrichmentService>),
            settings: Arc::new(fast_settings()),
            token: registry.token(run_id),
        };
        Harness {
            store,
            registry,
            collector,
        }
    }

    fn feed_only(adapter: Arc<MockAdapter>) -> AdapterSet {
        AdapterSet::new().with(SourceKind::Feed, adapter as Arc<dyn FetchAdapter>)
    }

    #[tokio::test]
    async fn missing_adapter_fails_the_source() {
        let h = harness(AdapterSet::new(), MockContentFetcher::new(), None);

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("no fetch adapter registered for kind feed")
        );
        let ledger = h.store.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, LedgerStatus::Error);
        assert_eq!(
            h.store.source("desk").unwrap().last_error.as_deref(),
            Some("no fetch adapter registered for kind feed")
        );
    }

    #[tokio::test]
    async fn invalid_source_is_never_fetched() {
        let adapter = Arc::new(
            MockAdapter::new()
                .on("desk", vec![candidate("https://desk.example/a", 300)])
                .invalid("desk", "url is required"),
        );
        let h = harness(feed_only(adapter.clone()), MockContentFetcher::new(), None);

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("url is required"));
        assert_eq!(adapter.call_count("desk"), 0);
        assert!(h.store.items().is_empty());
    }

    #[tokio::test]
    async fn adapter_error_names_the_source() {
        let adapter = Arc::new(MockAdapter::new().failing("desk", "HTTP 503"));
        let h = harness(feed_only(adapter), MockContentFetcher::new(), None);

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        let error = outcome.error.unwrap();
        assert!(error.contains("desk"), "{error}");
        assert!(error.contains("HTTP 503"), "{error}");
    }

    #[tokio::test]
    async fn missing_content_is_fetched_before_upsert() {
        let adapter = Arc::new(MockAdapter::new().on(
            "desk",
            vec![
                candidate("https://desk.example/bare", 0),
                candidate("https://desk.example/unreachable", 0),
                candidate("https://desk.example/full", 120),
            ],
        ));
        let pages = MockContentFetcher::new().on_page("https://desk.example/bare", "Fetched body text");
        let h = harness(feed_only(adapter), pages, None);

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.total_items, 3);
        assert_eq!(outcome.new_items, 3);
        assert_eq!(
            h.store.item_by_url("https://desk.example/bare").unwrap().content.as_deref(),
            Some("Fetched body text")
        );
        assert!(h
            .store
            .item_by_url("https://desk.example/unreachable")
            .unwrap()
            .content
            .is_none());
    }

    #[tokio::test]
    async fn enriches_new_items_and_the_backlog() {
        let mut old = Item::from_candidate(&candidate("https://desk.example/old", 200), "desk", Utc::now());
        old.title = "Old story".into();
        let enrichment = Arc::new(CountingEnrichment::new());
        let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/new", 200)]));
        let h = harness(feed_only(adapter), MockContentFetcher::new(), Some(enrichment.clone()));
        h.store.seed_item(old);

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        assert_eq!(outcome.enriched_count, 2);
        assert_eq!(enrichment.calls(), 2);
        assert_eq!(enrichment.handles(), 2);
        let old = h.store.item_by_url("https://desk.example/old").unwrap();
        assert!(old.is_enriched);
        assert_eq!(old.summary.as_deref(), Some("Summary of Old story"));
    }

    #[tokio::test]
    async fn backlog_sweep_can_be_turned_off() {
        let old = Item::from_candidate(&candidate("https://desk.example/old", 200), "desk", Utc::now());
        let enrichment = Arc::new(CountingEnrichment::new());
        let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/new", 200)]));
        let mut h = harness(feed_only(adapter), MockContentFetcher::new(), Some(enrichment.clone()));
        h.collector.settings = Arc::new(fast_settings().with_backlog_limit(0));
        h.store.seed_item(old);

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        assert_eq!(outcome.enriched_count, 1);
        assert!(!h.store.item_by_url("https://desk.example/old").unwrap().is_enriched);
    }

    #[tokio::test]
    async fn enrichment_failure_leaves_item_for_a_later_pass() {
        let enrichment = Arc::new(CountingEnrichment::failing_for(&["Item https://desk.example/b"]));
        let adapter = Arc::new(MockAdapter::new().on(
            "desk",
            vec![
                candidate("https://desk.example/a", 200),
                candidate("https://desk.example/b", 200),
            ],
        ));
        let h = harness(feed_only(adapter), MockContentFetcher::new(), Some(enrichment));

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.enriched_count, 1);
        assert!(!h.store.item_by_url("https://desk.example/b").unwrap().is_enriched);
    }

    #[tokio::test]
    async fn no_enrichment_service_means_no_calls() {
        let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/a", 200)]));
        let h = harness(feed_only(adapter), MockContentFetcher::new(), None);

        let outcome = h.collector.process(&feed_source("desk")).await.unwrap();

        assert_eq!(outcome.enriched_count, 0);
        assert!(!h.store.item_by_url("https://desk.example/a").unwrap().is_enriched);
    }

    #[tokio::test]
    async fn stopped_run_skips_the_source_without_a_trace() {
        let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/a", 200)]));
        let h = harness(feed_only(adapter.clone()), MockContentFetcher::new(), None);
        h.registry.request_stop(h.collector.run_id);

        assert!(h.collector.process(&feed_source("desk")).await.is_none());
        assert_eq!(adapter.call_count("desk"), 0);
        assert!(h.store.ledger().is_empty());
    }
}

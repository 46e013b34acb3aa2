// Collaborator seams for the engine.
//
// FetchAdapter     : one per source kind, source protocol -> CandidateItems
// ContentFetcher   : fills in content for candidates that arrived without any
// EnrichmentService: stateless factory; every concurrent call asks for its own Enricher
//
// Failures at these seams are opaque (anyhow); the engine records the
// rendered message and moves on.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use inflow_common::{CandidateItem, EnrichedFields, EnrichmentRequest, SourceConfig, SourceKind};

#[async_trait]
pub trait FetchAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap structural check of a source's configuration. A source that
    /// fails validation is never fetched.
    fn validate(&self, source: &SourceConfig) -> std::result::Result<(), String>;

    /// All candidates currently offered by the source. An empty list means
    /// "nothing new", errors are reserved for hard failures.
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<CandidateItem>>;
}

/// Fetch adapters keyed by the source kind they serve.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<SourceKind, Arc<dyn FetchAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: SourceKind, adapter: Arc<dyn FetchAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Option<&Arc<dyn FetchAdapter>> {
        self.adapters.get(&kind)
    }
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Readable text of the page at `url`.
    async fn fetch_content(&self, url: &str) -> Result<String>;
}

pub trait EnrichmentService: Send + Sync {
    /// A fresh, independent handle. Never shared between concurrent calls.
    fn handle(&self) -> Box<dyn Enricher>;
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, request: EnrichmentRequest) -> Result<EnrichedFields>;
}

use std::time::Duration;

use inflow_common::FileConfig;

use crate::upsert::UpsertPolicy;

/// Engine-side projection of [`FileConfig`]: pool widths, per-call timeouts,
/// and thresholds. Tests build one directly.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub source_workers: usize,
    pub fetch_workers: usize,
    pub enrich_workers: usize,
    pub adapter_timeout: Duration,
    pub content_fetch_timeout: Duration,
    pub enrich_timeout: Duration,
    pub notify_timeout: Duration,
    pub stale_after: chrono::Duration,
    pub upsert: UpsertPolicy,
    /// Previously stored unenriched items per source added to each enrichment pass.
    pub backlog_limit: i64,
    pub custom_prompt: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&FileConfig::default())
    }
}

impl From<&FileConfig> for EngineSettings {
    fn from(config: &FileConfig) -> Self {
        Self {
            // A zero width would stall buffer_unordered forever.
            source_workers: config.concurrency.source_workers.max(1),
            fetch_workers: config.concurrency.fetch_workers.max(1),
            enrich_workers: config.concurrency.enrich_workers.max(1),
            adapter_timeout: config.timeouts.adapter(),
            content_fetch_timeout: config.timeouts.content_fetch(),
            enrich_timeout: config.timeouts.enrich(),
            notify_timeout: config.timeouts.notify(),
            stale_after: chrono::Duration::minutes(config.runs.stale_after_minutes.max(1)),
            upsert: UpsertPolicy {
                max_attempts: config.upsert.max_attempts.max(1),
                base_backoff: Duration::from_millis(config.upsert.base_backoff_ms),
            },
            backlog_limit: config.enrichment.backlog_limit.max(0),
            custom_prompt: config.enrichment.custom_prompt.clone(),
        }
    }
}

impl EngineSettings {
    pub fn with_source_workers(mut self, n: usize) -> Self {
        self.source_workers = n.max(1);
        self
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_backlog_limit(mut self, limit: i64) -> Self {
        self.backlog_limit = limit.max(0);
        self
    }
}

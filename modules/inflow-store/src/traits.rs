// Persistence seams used by the engine.
//
// ItemStore   : at-most-one-row-per-url item table
// RunLedger   : run rows and append-only per-source outcome rows
// SourceRegistry: enabled sources plus their bookkeeping fields
//
// Each call is a self-contained unit of work: implementations take a fresh
// connection (or lock) per call and never hold one across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use inflow_common::{
    EnrichedFields, Item, LedgerEntry, Run, RunCounters, RunStatus, SourceConfig, SourceKind,
};

use crate::error::StoreResult;

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn find_by_url(&self, url: &str) -> StoreResult<Option<Item>>;

    /// Items for whichever of `urls` exist. Order is unspecified.
    async fn find_by_urls(&self, urls: &[String]) -> StoreResult<Vec<Item>>;

    async fn get_item(&self, id: Uuid) -> StoreResult<Option<Item>>;

    /// Insert a brand new row. Fails with `UniqueViolation` if the url exists.
    async fn insert_item(&self, item: &Item) -> StoreResult<()>;

    /// Overwrite the mutable fields of an existing row (matched by id).
    async fn merge_item(&self, item: &Item) -> StoreResult<()>;

    /// The subset of `ids` that are still unenriched and have content.
    async fn unenriched_among(&self, ids: &[Uuid]) -> StoreResult<Vec<Item>>;

    /// Backlog of unenriched items with content attributed to a source.
    async fn unenriched_for_source(&self, source_name: &str, limit: i64) -> StoreResult<Vec<Item>>;

    /// Write enrichment fields. Returns false if the item was already enriched
    /// (another run got there first) and nothing was written.
    async fn apply_enrichment(
        &self,
        id: Uuid,
        fields: &EnrichedFields,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn count_items(&self) -> StoreResult<i64>;
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Insert a running row. Fails with `RunningRunExists` if one is already running.
    async fn create_run(&self, run: &Run) -> StoreResult<()>;

    async fn update_counters(&self, run_id: Uuid, counters: &RunCounters) -> StoreResult<()>;

    /// Transition a running row to a terminal status. Returns false (and
    /// writes nothing) if the row was no longer running.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<&str>,
        counters: &RunCounters,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>>;

    async fn latest_run(&self) -> StoreResult<Option<Run>>;

    /// Most recent first.
    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>>;

    async fn running_runs(&self) -> StoreResult<Vec<Run>>;

    /// Relabel running rows started before `cutoff` as error. Returns their ids.
    async fn mark_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>>;

    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn entries_for_run(&self, run_id: Uuid) -> StoreResult<Vec<LedgerEntry>>;

    /// The most recent entry for every source that has one.
    async fn latest_entries_per_source(&self) -> StoreResult<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Enabled sources of one kind, highest priority first, then by name.
    async fn enabled_sources(&self, kind: SourceKind) -> StoreResult<Vec<SourceConfig>>;

    async fn all_sources(&self) -> StoreResult<Vec<SourceConfig>>;

    /// Create or replace a source by name.
    async fn register_source(&self, source: &SourceConfig) -> StoreResult<()>;

    /// Stamp a successful collection and clear the last error.
    async fn record_success(
        &self,
        name: &str,
        item_count: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn record_failure(&self, name: &str, message: &str) -> StoreResult<()>;
}

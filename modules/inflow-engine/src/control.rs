//! Run control surface: admission, spawning, stop, status.
//!
//! Admission order is registry slot first (in-process, synchronous), then the
//! stale-run sweep, then the ledger's view of running rows, then the ledger
//! insert. The database's single-running index backs up the last step.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use inflow_common::{
    IngestError, IngestResult, LedgerEntry, Run, RunCounters, RunStatus,
    STALE_RUN_MESSAGE,
};
use inflow_store::{ItemStore, RunLedger, SourceRegistry, StoreError};

use crate::collector::SourceCollector;
use crate::engine::RunEngine;
use crate::notify::{RunNotification, RunNotifier};
use crate::registry::RunRegistry;
use crate::settings::EngineSettings;
use crate::traits::{AdapterSet, ContentFetcher, EnrichmentService};

/// Stores and collaborators a [`RunControl`] drives runs with.
#[derive(Clone)]
pub struct EngineDeps {
    pub items: Arc<dyn ItemStore>,
    pub ledger: Arc<dyn RunLedger>,
    pub sources: Arc<dyn SourceRegistry>,
    pub adapters: AdapterSet,
    pub content: Arc<dyn ContentFetcher>,
    pub enrichment: Option<Arc<dyn EnrichmentService>>,
    pub notifier: Option<Arc<dyn RunNotifier>>,
}

impl EngineDeps {
    /// All three store roles served by one backend.
    pub fn from_store<S>(store: Arc<S>, adapters: AdapterSet, content: Arc<dyn ContentFetcher>) -> Self
    where
        S: ItemStore + RunLedger + SourceRegistry + 'static,
    {
        Self {
            items: store.clone(),
            ledger: store.clone(),
            sources: store,
            adapters,
            content,
            enrichment: None,
            notifier: None,
        }
    }

    pub fn with_enrichment(mut self, service: Arc<dyn EnrichmentService>) -> Self {
        self.enrichment = Some(service);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RunNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusQuery {
    Run(Uuid),
    Latest,
}

/// A run's ledger row reconciled with in-process liveness.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run: Run,
    pub live: bool,
    pub stop_requested: bool,
    /// Ledger says running but no live registry entry backs it.
    pub orphaned: bool,
    pub sources: Vec<LedgerEntry>,
}

#[derive(Clone)]
pub struct RunControl {
    deps: Arc<EngineDeps>,
    settings: Arc<EngineSettings>,
    registry: Arc<RunRegistry>,
}

impl RunControl {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        Self {
            deps: Arc::new(deps),
            settings: Arc::new(settings),
            registry: Arc::new(RunRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Admit a run and drive it on a background task. Returns once the run
    /// row exists.
    pub async fn start_run(&self, enrichment_enabled: bool) -> IngestResult<Uuid> {
        let run = self.admit(enrichment_enabled).await?;
        let run_id = run.id;
        let control = self.clone();
        tokio::spawn(async move {
            control.drive(run).await;
        });
        Ok(run_id)
    }

    /// Admit a run and drive it to a terminal state on the current task.
    pub async fn run_to_completion(&self, enrichment_enabled: bool) -> IngestResult<Run> {
        let run = self.admit(enrichment_enabled).await?;
        Ok(self.drive(run).await)
    }

    /// Ask a live run to stop at its next checkpoint. False if no such run is
    /// live in this process.
    pub fn stop_run(&self, run_id: Uuid) -> bool {
        let accepted = self.registry.request_stop(run_id);
        if accepted {
            info!(run_id = %run_id, "Stop requested");
        } else {
            warn!(run_id = %run_id, "Stop requested for a run that is not live");
        }
        accepted
    }

    pub async fn get_status(&self, query: StatusQuery) -> IngestResult<Option<RunStatusReport>> {
        let run = match query {
            StatusQuery::Run(id) => self.deps.ledger.get_run(id).await?,
            StatusQuery::Latest => self.deps.ledger.latest_run().await?,
        };
        let Some(run) = run else {
            return Ok(None);
        };

        let live = self.registry.is_live(run.id);
        let orphaned = run.status == RunStatus::Running && !live;
        if orphaned {
            warn!(run_id = %run.id, started_at = %run.started_at, "Ledger shows a running run with no live worker");
        }
        let sources = self.deps.ledger.entries_for_run(run.id).await?;

        Ok(Some(RunStatusReport {
            stop_requested: self.registry.is_stop_requested(run.id),
            live,
            orphaned,
            sources,
            run,
        }))
    }

    pub async fn list_recent_runs(&self, limit: i64) -> IngestResult<Vec<Run>> {
        Ok(self.deps.ledger.list_runs(limit).await?)
    }

    /// Relabel running rows older than the staleness threshold as error.
    /// A swept run that is still live here is asked to stop.
    pub async fn recover_stale_runs(&self) -> IngestResult<Vec<Uuid>> {
        let now = Utc::now();
        let cutoff = now - self.settings.stale_after;
        let swept = self
            .deps
            .ledger
            .mark_stale_runs(cutoff, STALE_RUN_MESSAGE, now)
            .await?;

        for run_id in &swept {
            warn!(run_id = %run_id, cutoff = %cutoff, "Relabelled stale run as error");
            if self.registry.is_live(*run_id) {
                self.registry.request_stop(*run_id);
            }
        }
        Ok(swept)
    }

    /// Most recent ledger entry for every source.
    pub async fn source_summaries(&self) -> IngestResult<Vec<LedgerEntry>> {
        Ok(self.deps.ledger.latest_entries_per_source().await?)
    }

    /// The run holding this process's live slot, if any.
    pub fn live_run_id(&self) -> Option<Uuid> {
        self.registry.live_run().map(|(id, _)| id)
    }

    async fn admit(&self, enrichment_requested: bool) -> IngestResult<Run> {
        let run_id = Uuid::new_v4();
        if let Err(active) = self.registry.begin(run_id) {
            warn!(active = %active, "Run rejected: another run is live");
            return Err(IngestError::RunAlreadyActive { run_id: active });
        }

        match self.admit_inner(run_id, enrichment_requested).await {
            Ok(run) => Ok(run),
            Err(e) => {
                self.registry.end(run_id);
                Err(e)
            }
        }
    }

    async fn admit_inner(&self, run_id: Uuid, enrichment_requested: bool) -> IngestResult<Run> {
        self.recover_stale_runs().await?;

        if let Some(active) = self.deps.ledger.running_runs().await?.first() {
            warn!(active = %active.id, "Run rejected: ledger shows a running run");
            return Err(IngestError::RunAlreadyActive { run_id: active.id });
        }

        let enrichment_enabled = enrichment_requested && self.deps.enrichment.is_some();
        if enrichment_requested && !enrichment_enabled {
            warn!("Enrichment requested but no enrichment service is configured, running without it");
        }

        let run = Run::start(run_id, enrichment_enabled, Utc::now());
        match self.deps.ledger.create_run(&run).await {
            Ok(()) => {}
            Err(StoreError::RunningRunExists) => {
                let active = self
                    .deps
                    .ledger
                    .running_runs()
                    .await?
                    .first()
                    .map(|r| r.id)
                    .unwrap_or_else(Uuid::nil);
                warn!(active = %active, "Run rejected: lost admission race");
                return Err(IngestError::RunAlreadyActive { run_id: active });
            }
            Err(e) => return Err(e.into()),
        }

        info!(run_id = %run_id, enrichment_enabled, "Run admitted");
        Ok(run)
    }

    fn collector(&self, run: &Run) -> SourceCollector {
        SourceCollector {
            run_id: run.id,
            items: self.deps.items.clone(),
            ledger: self.deps.ledger.clone(),
            sources: self.deps.sources.clone(),
            adapters: self.deps.adapters.clone(),
            content: self.deps.content.clone(),
            enrichment: if run.enrichment_enabled {
                self.deps.enrichment.clone()
            } else {
                None
            },
            settings: self.settings.clone(),
            token: self.registry.token(run.id),
        }
    }

    /// Run phases, finalize, release the slot, notify. Never fails: the
    /// returned run is always in a terminal state.
    async fn drive(&self, run: Run) -> Run {
        info!(run_id = %run.id, "Run starting");
        let engine = RunEngine::new(self.collector(&run));
        let (outcome, counters) = engine.run().await;
        let status = outcome.status();
        let error_message = outcome.error_message();

        self.finalize(run.id, status, error_message.clone(), counters.clone())
            .await;
        self.registry.end(run.id);

        let finished = match self.deps.ledger.get_run(run.id).await {
            Ok(Some(stored)) => stored,
            Ok(None) | Err(_) => Run {
                status,
                error_message,
                counters,
                completed_at: Some(Utc::now()),
                ..run
            },
        };
        info!(run_id = %finished.id, status = %finished.status, "Run finished. {}", finished.counters);

        self.notify(&finished).await;
        finished
    }

    /// The only transition out of running. Returns whether this call made it.
    async fn finalize(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
        counters: RunCounters,
    ) -> bool {
        match self
            .deps
            .ledger
            .finalize_run(run_id, status, error_message.as_deref(), &counters, Utc::now())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(run_id = %run_id, "Run was no longer running at finalization");
                false
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to finalize run");
                false
            }
        }
    }

    async fn notify(&self, run: &Run) {
        let Some(notifier) = &self.deps.notifier else {
            return;
        };
        let notification = RunNotification::from(run);
        match timeout(self.settings.notify_timeout, notifier.notify(&notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(run_id = %run.id, error = %e, "Run notification failed"),
            Err(_) => warn!(run_id = %run.id, "Run notification timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use inflow_store::MemoryStore;

    use super::*;
    use crate::testing::*;

    fn assert_send<T: Send>(_: &T) {}

    fn control_with_one_source() -> (Arc<MemoryStore>, RunControl) {
        let store = Arc::new(MemoryStore::with_sources([feed_source("desk")]));
        let adapter = Arc::new(MockAdapter::new().on("desk", vec![candidate("https://desk.example/1", 200)]));
        let control = memory_control(store.clone(), adapter, None, fast_settings());
        (store, control)
    }

    #[tokio::test]
    async fn drive_future_is_send() {
        let (_, control) = control_with_one_source();
        let run = control.admit(false).await.unwrap();

        let driving = control.drive(run);
        assert_send(&driving);

        let finished = driving.await;
        assert_eq!(finished.status, RunStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn started_run_finishes_on_a_worker_thread() {
        let (store, control) = control_with_one_source();

        let run_id = control.start_run(false).await.unwrap();

        for _ in 0..500 {
            if !control.registry.is_live(run_id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counters.success_sources, 1);
        assert!(store.item_by_url("https://desk.example/1").is_some());
    }
}

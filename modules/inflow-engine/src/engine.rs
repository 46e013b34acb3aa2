//! Phase driver: one phase per source kind, strictly in order, sources within
//! a phase fanned out on the tier-1 pool.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use inflow_common::{IngestError, IngestResult, RunCounters, RunOutcome, SourceConfig, SourceKind, SourceOutcome};

use crate::collector::SourceCollector;
use crate::registry::Checkpoint;

pub struct RunEngine {
    collector: Arc<SourceCollector>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl RunEngine {
    pub fn new(collector: SourceCollector) -> Self {
        Self {
            collector: Arc::new(collector),
        }
    }

    /// Drive every phase. Never panics and never returns an error: anything
    /// that escapes the per-source isolation becomes a failed outcome.
    pub async fn run(&self) -> (RunOutcome, RunCounters) {
        let started = Instant::now();
        let mut counters = RunCounters::default();

        let outcome = match AssertUnwindSafe(self.run_inner(&mut counters, started))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(run_id = %self.collector.run_id, error = %e, "Run failed");
                RunOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(run_id = %self.collector.run_id, error = %message, "Run panicked");
                RunOutcome::Failed(
                    IngestError::UnhandledPhase {
                        phase: "run".to_string(),
                        message,
                    }
                    .to_string(),
                )
            }
        };

        counters.duration_secs = started.elapsed().as_secs_f64();
        (outcome, counters)
    }

    async fn run_inner(&self, counters: &mut RunCounters, started: Instant) -> IngestResult<RunOutcome> {
        let run_id = self.collector.run_id;

        for kind in SourceKind::PHASE_ORDER {
            self.run_phase(kind, counters).await?;

            counters.duration_secs = started.elapsed().as_secs_f64();
            if let Err(e) = self.collector.ledger.update_counters(run_id, counters).await {
                warn!(run_id = %run_id, phase = %kind, error = %e, "Failed to persist counters");
            }

            if self.collector.token.check(Checkpoint::PhaseBoundary(kind)) {
                info!(run_id = %run_id, phase = %kind, "Run stopped after phase");
                return Ok(RunOutcome::Stopped);
            }
        }

        Ok(RunOutcome::Completed)
    }

    async fn run_phase(&self, kind: SourceKind, counters: &mut RunCounters) -> IngestResult<()> {
        let sources = self
            .collector
            .sources
            .enabled_sources(kind)
            .await
            .map_err(|e| IngestError::UnhandledPhase {
                phase: kind.to_string(),
                message: e.to_string(),
            })?;

        if sources.is_empty() {
            debug!(phase = %kind, "No enabled sources");
            return Ok(());
        }
        info!(phase = %kind, sources = sources.len(), "Phase starting");

        // Each source task owns its collector handle and config.
        let collector = self.collector.clone();
        let outcomes: Vec<Option<SourceOutcome>> = stream::iter(
            sources
                .into_iter()
                .map(move |source| process_isolated(collector.clone(), source)),
        )
        .buffer_unordered(self.collector.settings.source_workers)
        .collect()
        .await;

        let mut phase = RunCounters::default();
        for outcome in outcomes.into_iter().flatten() {
            phase.absorb(&outcome);
            counters.absorb(&outcome);
        }
        info!(
            phase = %kind,
            sources = phase.total_sources,
            failed = phase.failed_sources,
            new = phase.new_items,
            enriched = phase.enriched_count,
            "Phase complete"
        );
        Ok(())
    }
}

/// A panicking source becomes a failed source; siblings keep running.
async fn process_isolated(collector: Arc<SourceCollector>, source: SourceConfig) -> Option<SourceOutcome> {
    let started_at = Utc::now();
    match AssertUnwindSafe(collector.process(&source)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = format!("source task panicked: {}", panic_message(&*panic));
            let outcome = SourceOutcome::failed(&source, message);
            collector.record(&source, &outcome, started_at).await;
            Some(outcome)
        }
    }
}

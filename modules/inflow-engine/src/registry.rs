//! Process-wide run liveness and cooperative stop flags.
//!
//! The registry is the only owner of this state. Everything else sees it
//! through [`RunRegistry`] methods or a [`StopToken`] handed to the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use inflow_common::SourceKind;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LiveRun {
    started_at: DateTime<Utc>,
    stop_requested: bool,
}

#[derive(Default)]
pub struct RunRegistry {
    live: Mutex<HashMap<Uuid, LiveRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, LiveRun>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the single live slot. Returns the id of the run already holding
    /// it if there is one.
    pub fn begin(&self, run_id: Uuid) -> Result<(), Uuid> {
        let mut live = self.lock();
        if let Some(existing) = live.keys().next() {
            return Err(*existing);
        }
        live.insert(
            run_id,
            LiveRun {
                started_at: Utc::now(),
                stop_requested: false,
            },
        );
        Ok(())
    }

    /// Release the slot and drop the run's stop flag.
    pub fn end(&self, run_id: Uuid) {
        self.lock().remove(&run_id);
    }

    /// Raise the stop flag. False if the run is not live in this process.
    pub fn request_stop(&self, run_id: Uuid) -> bool {
        match self.lock().get_mut(&run_id) {
            Some(run) => {
                run.stop_requested = true;
                true
            }
            None => false,
        }
    }

    pub fn is_stop_requested(&self, run_id: Uuid) -> bool {
        self.lock()
            .get(&run_id)
            .is_some_and(|run| run.stop_requested)
    }

    pub fn is_live(&self, run_id: Uuid) -> bool {
        self.lock().contains_key(&run_id)
    }

    /// The live run and when it was registered, if any.
    pub fn live_run(&self) -> Option<(Uuid, DateTime<Utc>)> {
        self.lock()
            .iter()
            .next()
            .map(|(id, run)| (*id, run.started_at))
    }

    pub fn token(self: &Arc<Self>, run_id: Uuid) -> StopToken {
        StopToken {
            registry: Arc::clone(self),
            run_id,
        }
    }
}

/// Places where the engine polls for a stop request. Work already dispatched
/// when the flag is raised always runs to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// After a phase's sources have all finished.
    PhaseBoundary(SourceKind),
    /// Before a queued source calls its adapter.
    BeforeSource,
    /// Before a source fans out content fetches.
    BeforeContentFetch,
    /// Before a source fans out enrichment calls.
    BeforeEnrichment,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::PhaseBoundary(kind) => write!(f, "end of {kind} phase"),
            Checkpoint::BeforeSource => f.write_str("before source"),
            Checkpoint::BeforeContentFetch => f.write_str("before content fetch"),
            Checkpoint::BeforeEnrichment => f.write_str("before enrichment"),
        }
    }
}

/// Cancellation token threaded through a run's call chain.
#[derive(Clone)]
pub struct StopToken {
    registry: Arc<RunRegistry>,
    run_id: Uuid,
}

impl StopToken {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_stopped(&self) -> bool {
        self.registry.is_stop_requested(self.run_id)
    }

    /// Poll the flag at `checkpoint`. True means stop scheduling new work.
    pub fn check(&self, checkpoint: Checkpoint) -> bool {
        let stopped = self.is_stopped();
        if stopped {
            info!(run_id = %self.run_id, checkpoint = %checkpoint, "Stop request observed");
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_reports_the_live_run() {
        let registry = RunRegistry::new();
        let first = Uuid::new_v4();
        registry.begin(first).unwrap();

        assert_eq!(registry.begin(Uuid::new_v4()), Err(first));

        registry.end(first);
        assert!(registry.begin(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn stop_flag_lives_and_dies_with_the_run() {
        let registry = Arc::new(RunRegistry::new());
        let run_id = Uuid::new_v4();
        assert!(!registry.request_stop(run_id));

        registry.begin(run_id).unwrap();
        let token = registry.token(run_id);
        assert!(!token.check(Checkpoint::BeforeSource));

        assert!(registry.request_stop(run_id));
        assert!(token.check(Checkpoint::PhaseBoundary(SourceKind::Feed)));

        registry.end(run_id);
        assert!(!registry.is_live(run_id));
        assert!(!token.is_stopped());
    }
}

//! Error taxonomy for ingestion runs.
//!
//! Item- and source-level failures are absorbed by the engine and only ever
//! show up here as recorded messages. Run-level errors surface to callers as
//! explicit rejections or as a terminal run status.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    /// A fetch adapter, content fetch, or enrichment call failed.
    #[error("adapter failure ({source_name}): {message}")]
    AdapterFailure {
        source_name: String,
        message: String,
    },

    /// Concurrent first-insert collision that kept losing after every retry.
    #[error("unique constraint race on {url} persisted after {attempts} attempts")]
    UniqueConstraintRace { url: String, attempts: u32 },

    /// Admission rejected: another run holds the single-run slot.
    #[error("run {run_id} is already active")]
    RunAlreadyActive { run_id: Uuid },

    /// A running ledger row outlived the staleness threshold.
    #[error("run {run_id} was abandoned while running")]
    StaleRun { run_id: Uuid },

    /// Cooperative cancellation observed by the engine.
    #[error("run manually stopped")]
    ManualStop,

    /// A phase failed outside any per-source isolation boundary.
    #[error("unhandled error in {phase} phase: {message}")]
    UnhandledPhase { phase: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),
}

impl IngestError {
    pub fn adapter(source_name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::AdapterFailure {
            source_name: source_name.into(),
            message: err.to_string(),
        }
    }

    /// True for errors that reject a run before it starts.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::RunAlreadyActive { .. })
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_failure_renders_source_and_message() {
        let err = IngestError::adapter("city-feed", "connection reset");
        assert_eq!(
            err.to_string(),
            "adapter failure (city-feed): connection reset"
        );
    }

    #[test]
    fn only_active_run_is_a_rejection() {
        assert!(IngestError::RunAlreadyActive { run_id: Uuid::nil() }.is_rejection());
        assert!(!IngestError::ManualStop.is_rejection());
    }
}

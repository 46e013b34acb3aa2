pub mod adapters;
pub mod classify;
pub mod collector;
pub mod control;
pub mod engine;
pub mod enrichment;
pub mod notify;
pub mod registry;
pub mod settings;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod upsert;

pub use control::{EngineDeps, RunControl, RunStatusReport, StatusQuery};
pub use registry::{Checkpoint, RunRegistry, StopToken};
pub use settings::EngineSettings;
pub use traits::{AdapterSet, ContentFetcher, Enricher, EnrichmentService, FetchAdapter};

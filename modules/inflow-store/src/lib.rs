pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::{migrate, PgStore};
pub use traits::{ItemStore, RunLedger, SourceRegistry};

pub mod config;
pub mod error;
pub mod file_config;
pub mod types;
pub mod canonical;

pub use config::AppConfig;
pub use error::{IngestError, IngestResult};
pub use file_config::FileConfig;
pub use types::*;
pub use canonical::canonical_url;

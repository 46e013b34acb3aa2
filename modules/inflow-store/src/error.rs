use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another row already owns this url (lost a first-sighting race).
    #[error("item with url {url} already exists")]
    UniqueViolation { url: String },

    /// The single-running-run constraint rejected a new run row.
    #[error("another run is already marked running")]
    RunningRunExists,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be mapped back to a domain type.
    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for inflow_common::IngestError {
    fn from(err: StoreError) -> Self {
        inflow_common::IngestError::Store(err.to_string())
    }
}

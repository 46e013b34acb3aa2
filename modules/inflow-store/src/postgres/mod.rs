mod items;
mod migrate;
mod runs;
mod sources;

pub use migrate::migrate;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{StoreError, StoreResult};

/// Postgres-backed store. Every call checks a connection out of the pool for
/// the duration of that call only.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// True for SQLSTATE 23505 raised by the named index.
pub(crate) fn is_unique_violation_on(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() && db.constraint().map_or(true, |c| c == constraint)
        }
        _ => false,
    }
}

pub(crate) fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn decode<T: std::str::FromStr<Err = String>>(raw: &str) -> StoreResult<T> {
    raw.parse().map_err(StoreError::Decode)
}

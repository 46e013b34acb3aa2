use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use inflow_common::{SourceConfig, SourceKind};

use super::{decode, PgStore};
use crate::error::{StoreError, StoreResult};
use crate::traits::SourceRegistry;

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    kind: String,
    subtype: Option<String>,
    url: Option<String>,
    connection: serde_json::Value,
    priority: i32,
    enabled: bool,
    last_collected_at: Option<DateTime<Utc>>,
    total_items_collected: i64,
    last_error: Option<String>,
}

impl TryFrom<SourceRow> for SourceConfig {
    type Error = StoreError;

    fn try_from(row: SourceRow) -> StoreResult<Self> {
        Ok(SourceConfig {
            id: row.id,
            name: row.name,
            kind: decode(&row.kind)?,
            subtype: row.subtype,
            url: row.url,
            connection: row.connection,
            priority: row.priority,
            enabled: row.enabled,
            last_collected_at: row.last_collected_at,
            total_items_collected: row.total_items_collected,
            last_error: row.last_error,
        })
    }
}

const SOURCE_COLUMNS: &str = "id, name, kind, subtype, url, connection, priority, enabled, \
     last_collected_at, total_items_collected, last_error";

fn sources_from(rows: Vec<SourceRow>) -> StoreResult<Vec<SourceConfig>> {
    rows.into_iter().map(SourceConfig::try_from).collect()
}

#[async_trait]
impl SourceRegistry for PgStore {
    async fn enabled_sources(&self, kind: SourceKind) -> StoreResult<Vec<SourceConfig>> {
        let rows = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources
             WHERE enabled = TRUE AND kind = $1
             ORDER BY priority DESC, name ASC"
        ))
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        sources_from(rows)
    }

    async fn all_sources(&self) -> StoreResult<Vec<SourceConfig>> {
        let rows = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        sources_from(rows)
    }

    async fn register_source(&self, source: &SourceConfig) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, kind, subtype, url, connection, priority, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO UPDATE
            SET kind = EXCLUDED.kind, subtype = EXCLUDED.subtype, url = EXCLUDED.url,
                connection = EXCLUDED.connection, priority = EXCLUDED.priority,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(source.kind.as_str())
        .bind(&source.subtype)
        .bind(&source.url)
        .bind(&source.connection)
        .bind(source.priority)
        .bind(source.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_success(
        &self,
        name: &str,
        item_count: u32,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET last_collected_at = $2,
                total_items_collected = total_items_collected + $3,
                last_error = NULL
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(at)
        .bind(i64::from(item_count))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, name: &str, message: &str) -> StoreResult<()> {
        sqlx::query("UPDATE sources SET last_error = $2 WHERE name = $1")
            .bind(name)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

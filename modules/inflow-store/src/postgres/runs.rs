use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use inflow_common::{LedgerEntry, Run, RunCounters, RunStatus};

use super::migrate::SINGLE_RUNNING_INDEX;
use super::{decode, is_unique_violation_on, to_i32, to_u32, PgStore};
use crate::error::{StoreError, StoreResult};
use crate::traits::RunLedger;

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    total_sources: i32,
    success_sources: i32,
    failed_sources: i32,
    new_items: i32,
    updated_items: i32,
    enriched_count: i32,
    duration_secs: f64,
    enrichment_enabled: bool,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> StoreResult<Self> {
        Ok(Run {
            id: row.id,
            status: decode(&row.status)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            counters: RunCounters {
                total_sources: to_u32(row.total_sources),
                success_sources: to_u32(row.success_sources),
                failed_sources: to_u32(row.failed_sources),
                new_items: to_u32(row.new_items),
                updated_items: to_u32(row.updated_items),
                enriched_count: to_u32(row.enriched_count),
                duration_secs: row.duration_secs,
            },
            enrichment_enabled: row.enrichment_enabled,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    run_id: Uuid,
    source_name: String,
    kind: String,
    status: String,
    item_count: i32,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> StoreResult<Self> {
        Ok(LedgerEntry {
            id: row.id,
            run_id: row.run_id,
            source_name: row.source_name,
            kind: decode(&row.kind)?,
            status: decode(&row.status)?,
            item_count: to_u32(row.item_count),
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const RUN_COLUMNS: &str = "id, status, started_at, completed_at, error_message, total_sources, \
     success_sources, failed_sources, new_items, updated_items, enriched_count, duration_secs, \
     enrichment_enabled";

const LEDGER_COLUMNS: &str =
    "id, run_id, source_name, kind, status, item_count, error_message, started_at, completed_at";

fn runs_from(rows: Vec<RunRow>) -> StoreResult<Vec<Run>> {
    rows.into_iter().map(Run::try_from).collect()
}

fn entries_from(rows: Vec<LedgerRow>) -> StoreResult<Vec<LedgerEntry>> {
    rows.into_iter().map(LedgerEntry::try_from).collect()
}

#[async_trait]
impl RunLedger for PgStore {
    async fn create_run(&self, run: &Run) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, status, started_at, enrichment_enabled)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.enrichment_enabled)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation_on(&e, SINGLE_RUNNING_INDEX) => {
                Err(StoreError::RunningRunExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_counters(&self, run_id: Uuid, counters: &RunCounters) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET total_sources = $2, success_sources = $3, failed_sources = $4,
                new_items = $5, updated_items = $6, enriched_count = $7, duration_secs = $8
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(to_i32(counters.total_sources))
        .bind(to_i32(counters.success_sources))
        .bind(to_i32(counters.failed_sources))
        .bind(to_i32(counters.new_items))
        .bind(to_i32(counters.updated_items))
        .bind(to_i32(counters.enriched_count))
        .bind(counters.duration_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<&str>,
        counters: &RunCounters,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, error_message = $3, completed_at = $4,
                total_sources = $5, success_sources = $6, failed_sources = $7,
                new_items = $8, updated_items = $9, enriched_count = $10, duration_secs = $11
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(at)
        .bind(to_i32(counters.total_sources))
        .bind(to_i32(counters.success_sources))
        .bind(to_i32(counters.failed_sources))
        .bind(to_i32(counters.new_items))
        .bind(to_i32(counters.updated_items))
        .bind(to_i32(counters.enriched_count))
        .bind(counters.duration_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Run::try_from).transpose()
    }

    async fn latest_run(&self) -> StoreResult<Option<Run>> {
        Ok(self.list_runs(1).await?.into_iter().next())
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(limit.clamp(0, 500))
        .fetch_all(&self.pool)
        .await?;
        runs_from(rows)
    }

    async fn running_runs(&self) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running' ORDER BY started_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        runs_from(rows)
    }

    async fn mark_stale_runs(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE runs
            SET status = 'error', error_message = $2, completed_at = $3
            WHERE status = 'running' AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(message)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO run_ledger (id, run_id, source_name, kind, status, item_count,
                                    error_message, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.run_id)
        .bind(&entry.source_name)
        .bind(entry.kind.as_str())
        .bind(entry.status.as_str())
        .bind(to_i32(entry.item_count))
        .bind(&entry.error_message)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entries_for_run(&self, run_id: Uuid) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM run_ledger WHERE run_id = $1 ORDER BY completed_at ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        entries_from(rows)
    }

    async fn latest_entries_per_source(&self) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT DISTINCT ON (source_name) {LEDGER_COLUMNS}
             FROM run_ledger
             ORDER BY source_name, completed_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        entries_from(rows)
    }
}

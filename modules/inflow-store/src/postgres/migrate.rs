use sqlx::PgPool;
use tracing::info;

use crate::error::StoreResult;

pub(crate) const ITEMS_URL_INDEX: &str = "items_url_key";
pub(crate) const SINGLE_RUNNING_INDEX: &str = "runs_single_running";

/// Run idempotent schema migrations: tables, uniqueness, lookup indexes.
pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    info!("Running schema migrations...");

    let tables = [
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            subtype TEXT,
            url TEXT,
            connection JSONB NOT NULL DEFAULT '{}'::jsonb,
            priority INT NOT NULL DEFAULT 0,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            last_collected_at TIMESTAMPTZ,
            total_items_collected BIGINT NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id UUID PRIMARY KEY,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT,
            author TEXT,
            published_at TIMESTAMPTZ,
            summary TEXT,
            tags TEXT[] NOT NULL DEFAULT '{}',
            importance SMALLINT,
            category TEXT,
            is_enriched BOOLEAN NOT NULL DEFAULT FALSE,
            source_name TEXT NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            enriched_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ,
            error_message TEXT,
            total_sources INT NOT NULL DEFAULT 0,
            success_sources INT NOT NULL DEFAULT 0,
            failed_sources INT NOT NULL DEFAULT 0,
            new_items INT NOT NULL DEFAULT 0,
            updated_items INT NOT NULL DEFAULT 0,
            enriched_count INT NOT NULL DEFAULT 0,
            duration_secs DOUBLE PRECISION NOT NULL DEFAULT 0,
            enrichment_enabled BOOLEAN NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS run_ledger (
            id UUID PRIMARY KEY,
            run_id UUID NOT NULL REFERENCES runs(id),
            source_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            item_count INT NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ NOT NULL
        )
        "#,
    ];

    for stmt in &tables {
        sqlx::query(stmt).execute(pool).await?;
    }
    info!("Tables created");

    let indexes = [
        format!("CREATE UNIQUE INDEX IF NOT EXISTS {ITEMS_URL_INDEX} ON items (url)"),
        "CREATE INDEX IF NOT EXISTS items_unenriched_idx ON items (source_name, created_at) WHERE is_enriched = FALSE".to_string(),
        // At most one running run, enforced by the database as well as the registry.
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {SINGLE_RUNNING_INDEX} ON runs ((status)) WHERE status = 'running'"
        ),
        "CREATE INDEX IF NOT EXISTS runs_started_idx ON runs (started_at DESC)".to_string(),
        "CREATE INDEX IF NOT EXISTS run_ledger_run_idx ON run_ledger (run_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS run_ledger_source_idx ON run_ledger (source_name, completed_at DESC)".to_string(),
        "CREATE INDEX IF NOT EXISTS sources_kind_idx ON sources (kind) WHERE enabled = TRUE".to_string(),
    ];

    for stmt in &indexes {
        sqlx::query(stmt).execute(pool).await?;
    }
    info!("Indexes created");

    Ok(())
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use inflow_common::{EnrichedFields, Item};

use super::migrate::ITEMS_URL_INDEX;
use super::{is_unique_violation_on, PgStore};
use crate::error::{StoreError, StoreResult};
use crate::traits::ItemStore;

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    url: String,
    title: String,
    content: Option<String>,
    author: Option<String>,
    published_at: Option<DateTime<Utc>>,
    summary: Option<String>,
    tags: Vec<String>,
    importance: Option<i16>,
    category: Option<String>,
    is_enriched: bool,
    source_name: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    enriched_at: Option<DateTime<Utc>>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            id: row.id,
            url: row.url,
            title: row.title,
            content: row.content,
            author: row.author,
            published_at: row.published_at,
            summary: row.summary,
            tags: row.tags,
            importance: row.importance,
            category: row.category,
            is_enriched: row.is_enriched,
            source_name: row.source_name,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            enriched_at: row.enriched_at,
        }
    }
}

const ITEM_COLUMNS: &str = "id, url, title, content, author, published_at, summary, tags, \
     importance, category, is_enriched, source_name, metadata, created_at, updated_at, enriched_at";

#[async_trait]
impl ItemStore for PgStore {
    async fn find_by_url(&self, url: &str) -> StoreResult<Option<Item>> {
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE url = $1"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Item::from))
    }

    async fn find_by_urls(&self, urls: &[String]) -> StoreResult<Vec<Item>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE url = ANY($1)"
        ))
        .bind(urls)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn get_item(&self, id: Uuid) -> StoreResult<Option<Item>> {
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Item::from))
    }

    async fn insert_item(&self, item: &Item) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, url, title, content, author, published_at, summary, tags,
                               importance, category, is_enriched, source_name, metadata,
                               created_at, updated_at, enriched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(item.id)
        .bind(&item.url)
        .bind(&item.title)
        .bind(&item.content)
        .bind(&item.author)
        .bind(item.published_at)
        .bind(&item.summary)
        .bind(&item.tags)
        .bind(item.importance)
        .bind(&item.category)
        .bind(item.is_enriched)
        .bind(&item.source_name)
        .bind(&item.metadata)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.enriched_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation_on(&e, ITEMS_URL_INDEX) => Err(StoreError::UniqueViolation {
                url: item.url.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn merge_item(&self, item: &Item) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE items
            SET title = $2,
                content = CASE
                    WHEN length(btrim(coalesce($3, ''), E' \t\r\n'))
                       > length(btrim(coalesce(content, ''), E' \t\r\n')) THEN $3
                    ELSE content
                END,
                author = $4, published_at = $5,
                source_name = $6, metadata = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(&item.title)
        .bind(&item.content)
        .bind(&item.author)
        .bind(item.published_at)
        .bind(&item.source_name)
        .bind(&item.metadata)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("item {}", item.id)));
        }
        Ok(())
    }

    async fn unenriched_among(&self, ids: &[Uuid]) -> StoreResult<Vec<Item>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE id = ANY($1) AND is_enriched = FALSE
               AND content IS NOT NULL AND btrim(content) <> ''"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn unenriched_for_source(&self, source_name: &str, limit: i64) -> StoreResult<Vec<Item>> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE source_name = $1 AND is_enriched = FALSE
               AND content IS NOT NULL AND btrim(content) <> ''
             ORDER BY created_at ASC
             LIMIT $2"
        ))
        .bind(source_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn apply_enrichment(
        &self,
        id: Uuid,
        fields: &EnrichedFields,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE items
            SET summary = $2, tags = $3, importance = $4,
                category = COALESCE($5, category),
                is_enriched = TRUE, enriched_at = $6, updated_at = $6
            WHERE id = $1 AND is_enriched = FALSE
            "#,
        )
        .bind(id)
        .bind(&fields.summary)
        .bind(&fields.tags)
        .bind(fields.importance)
        .bind(&fields.category)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_items(&self) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

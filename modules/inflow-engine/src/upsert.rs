//! Idempotent lookup-or-insert keyed by canonical url.
//!
//! Two sources can first-sight the same url at the same time. The loser's
//! insert hits the unique index; it backs off and repeats the whole
//! lookup-or-insert, which then finds the winner's row and merges into it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use inflow_common::{CandidateItem, IngestError, IngestResult, Item};
use inflow_store::ItemStore;

#[derive(Debug, Clone)]
pub struct UpsertPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for UpsertPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: Uuid,
    pub is_new: bool,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Richer content is never discarded: replace only when nothing is stored or
/// the incoming body is strictly longer (trimmed, in chars). Any slack here
/// would make the surviving body depend on which source wrote first.
pub fn should_replace_content(stored: Option<&str>, incoming: Option<&str>) -> bool {
    let Some(incoming) = non_blank(incoming) else {
        return false;
    };
    match non_blank(stored) {
        None => true,
        Some(stored) => incoming.chars().count() > stored.chars().count(),
    }
}

/// The row that results from sighting `candidate` again.
pub fn merge_candidate(
    existing: &Item,
    candidate: &CandidateItem,
    source_name: &str,
    now: DateTime<Utc>,
) -> Item {
    let mut merged = existing.clone();

    if should_replace_content(
        existing.content.as_deref(),
        candidate.raw_content.as_deref(),
    ) {
        merged.content = candidate.raw_content.clone();
    }
    if !candidate.title.trim().is_empty() {
        merged.title = candidate.title.clone();
    }
    merged.source_name = source_name.to_string();
    if merged.author.is_none() {
        merged.author = candidate.author.clone();
    }
    if merged.published_at.is_none() {
        merged.published_at = candidate.published_at;
    }
    if let serde_json::Value::Object(map) = &mut merged.metadata {
        for (key, value) in &candidate.metadata {
            map.insert(key.clone(), value.clone());
        }
    }
    merged.updated_at = now;
    merged
}

/// Persist one candidate (url already canonical). Returns the row id and
/// whether this call created it.
pub async fn upsert_candidate(
    store: &dyn ItemStore,
    candidate: &CandidateItem,
    source_name: &str,
    policy: &UpsertPolicy,
) -> IngestResult<Upserted> {
    for attempt in 1..=policy.max_attempts {
        let now = Utc::now();
        if let Some(existing) = store.find_by_url(&candidate.url).await? {
            let merged = merge_candidate(&existing, candidate, source_name, now);
            store.merge_item(&merged).await?;
            return Ok(Upserted {
                id: existing.id,
                is_new: false,
            });
        }

        let item = Item::from_candidate(candidate, source_name, now);
        match store.insert_item(&item).await {
            Ok(()) => {
                return Ok(Upserted {
                    id: item.id,
                    is_new: true,
                })
            }
            Err(e) if e.is_unique_violation() => {
                debug!(url = %candidate.url, attempt, "Lost first-insert race, retrying");
                tokio::time::sleep(policy.base_backoff * attempt).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(IngestError::UniqueConstraintRace {
        url: candidate.url.clone(),
        attempts: policy.max_attempts,
    })
}

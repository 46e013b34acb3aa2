use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message recorded on a run that ended because someone asked it to stop.
pub const MANUAL_STOP_MESSAGE: &str = "Run manually stopped";

/// Message recorded on runs relabelled by the stale-run sweep.
pub const STALE_RUN_MESSAGE: &str = "Run abandoned: no progress before the staleness threshold";

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Protocol family of a source. Each kind is one phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Feed,
    Provider,
    Web,
    Mailbox,
}

impl SourceKind {
    /// Phases run strictly in this order.
    pub const PHASE_ORDER: [SourceKind; 4] = [
        SourceKind::Feed,
        SourceKind::Provider,
        SourceKind::Web,
        SourceKind::Mailbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::Provider => "provider",
            SourceKind::Web => "web",
            SourceKind::Mailbox => "mailbox",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feed" => Ok(SourceKind::Feed),
            "provider" => Ok(SourceKind::Provider),
            "web" => Ok(SourceKind::Web),
            "mailbox" => Ok(SourceKind::Mailbox),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// A configured content origin. Read-only during a run except for the
/// bookkeeping fields (`last_collected_at`, `total_items_collected`, `last_error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: Uuid,
    pub name: String,
    pub kind: SourceKind,
    pub subtype: Option<String>,
    pub url: Option<String>,
    /// Adapter-specific connection settings (credentials refs, page size, folders...).
    pub connection: serde_json::Value,
    pub priority: i32,
    pub enabled: bool,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub total_items_collected: i64,
    pub last_error: Option<String>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            subtype: None,
            url: None,
            connection: serde_json::Value::Object(Default::default()),
            priority: 0,
            enabled: true,
            last_collected_at: None,
            total_items_collected: 0,
            last_error: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_connection(mut self, connection: serde_json::Value) -> Self {
        self.connection = connection;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// String setting from `connection`, if present.
    pub fn connection_str(&self, key: &str) -> Option<&str> {
        self.connection.get(key).and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Adapter output. Never persisted as-is; the engine upserts it into an [`Item`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateItem {
    pub title: String,
    pub url: String,
    pub raw_content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CandidateItem {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            raw_content: None,
            author: None,
            published_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.raw_content = Some(content.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn has_content(&self) -> bool {
        self.raw_content
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

/// Persisted item. Exactly one row per url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub importance: Option<i16>,
    pub category: Option<String>,
    pub is_enriched: bool,
    pub source_name: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub enriched_at: Option<DateTime<Utc>>,
}

impl Item {
    /// First sighting of a candidate. `url` is expected to be canonical already.
    pub fn from_candidate(candidate: &CandidateItem, source_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: candidate.url.clone(),
            title: candidate.title.clone(),
            content: candidate.raw_content.clone().filter(|c| !c.trim().is_empty()),
            author: candidate.author.clone(),
            published_at: candidate.published_at,
            summary: None,
            tags: Vec::new(),
            importance: None,
            category: None,
            is_enriched: false,
            source_name: source_name.to_string(),
            metadata: serde_json::to_value(&candidate.metadata)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
            created_at: now,
            updated_at: now,
            enriched_at: None,
        }
    }

    pub fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    /// Content and enrichment both present: nothing left to do for this item.
    pub fn is_fully_processed(&self) -> bool {
        self.has_content() && self.is_enriched
    }

    pub fn content_len(&self) -> usize {
        self.content.as_deref().map(|c| c.chars().count()).unwrap_or(0)
    }
}

/// AI-produced augmentation of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnrichedFields {
    /// Two to four sentence neutral summary.
    pub summary: String,
    /// Short lowercase topical tags.
    pub tags: Vec<String>,
    /// Importance from 1 (trivial) to 10 (critical).
    pub importance: i16,
    /// Optional coarse category (e.g. "policy", "research", "release").
    pub category: Option<String>,
}

/// Input to a single enrichment call.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRequest {
    pub title: String,
    pub content: String,
    pub source_name: String,
    pub category: Option<String>,
    pub custom_prompt: Option<String>,
}

impl EnrichmentRequest {
    pub fn for_item(item: &Item, custom_prompt: Option<String>) -> Self {
        Self {
            title: item.title.clone(),
            content: item.content.clone().unwrap_or_default(),
            source_name: item.source_name.clone(),
            category: item.category.clone(),
            custom_prompt,
        }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Aggregated counters for a run. Persisted after every phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_sources: u32,
    pub success_sources: u32,
    pub failed_sources: u32,
    pub new_items: u32,
    pub updated_items: u32,
    pub enriched_count: u32,
    pub duration_secs: f64,
}

impl RunCounters {
    pub fn absorb(&mut self, outcome: &SourceOutcome) {
        self.total_sources += 1;
        if outcome.success {
            self.success_sources += 1;
        } else {
            self.failed_sources += 1;
        }
        self.new_items += outcome.new_items;
        self.updated_items += outcome.updated_items;
        self.enriched_count += outcome.enriched_count;
    }
}

impl fmt::Display for RunCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sources:        {}", self.total_sources)?;
        writeln!(f, "  succeeded:    {}", self.success_sources)?;
        writeln!(f, "  failed:       {}", self.failed_sources)?;
        writeln!(f, "New items:      {}", self.new_items)?;
        writeln!(f, "Updated items:  {}", self.updated_items)?;
        writeln!(f, "Enriched:       {}", self.enriched_count)?;
        write!(f, "Duration:       {:.1}s", self.duration_secs)
    }
}

/// One invocation of the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub counters: RunCounters,
    pub enrichment_enabled: bool,
}

impl Run {
    pub fn start(id: Uuid, enrichment_enabled: bool, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            error_message: None,
            counters: RunCounters::default(),
            enrichment_enabled,
        }
    }

    pub fn was_manually_stopped(&self) -> bool {
        self.status == RunStatus::Error && self.error_message.as_deref() == Some(MANUAL_STOP_MESSAGE)
    }
}

/// How a run left the running state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Stopped,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed(_) | RunOutcome::Stopped => RunStatus::Error,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            RunOutcome::Completed => None,
            RunOutcome::Failed(msg) => Some(msg.clone()),
            RunOutcome::Stopped => Some(MANUAL_STOP_MESSAGE.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Success,
    Error,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Success => "success",
            LedgerStatus::Error => "error",
        }
    }
}

impl FromStr for LedgerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(LedgerStatus::Success),
            "error" => Ok(LedgerStatus::Error),
            other => Err(format!("unknown ledger status: {other}")),
        }
    }
}

/// Append-only record of one source's outcome within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source_name: String,
    pub kind: SourceKind,
    pub status: LedgerStatus,
    pub item_count: u32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_outcome(run_id: Uuid, outcome: &SourceOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            source_name: outcome.source_name.clone(),
            kind: outcome.kind,
            status: if outcome.success {
                LedgerStatus::Success
            } else {
                LedgerStatus::Error
            },
            item_count: outcome.total_items,
            error_message: outcome.error.clone(),
            started_at,
            completed_at: Utc::now(),
        }
    }
}

/// Result of processing one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    pub source_name: String,
    pub kind: SourceKind,
    pub total_items: u32,
    pub new_items: u32,
    pub updated_items: u32,
    pub enriched_count: u32,
    pub success: bool,
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn failed(source: &SourceConfig, error: impl Into<String>) -> Self {
        Self {
            source_name: source.name.clone(),
            kind: source.kind,
            total_items: 0,
            new_items: 0,
            updated_items: 0,
            enriched_count: 0,
            success: false,
            error: Some(error.into()),
        }
    }
}

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// TOML-backed tunables. Every section and field has a default, so an empty
/// (or missing) file yields a working configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutsConfig,
    pub runs: RunsConfig,
    pub upsert: UpsertConfig,
    pub enrichment: EnrichmentConfig,
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Tier 1: sources processed at once within a phase.
    pub source_workers: usize,
    /// Tier 2: content fetches in flight per source.
    pub fetch_workers: usize,
    /// Tier 2: enrichment calls in flight per source.
    pub enrich_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            source_workers: 5,
            fetch_workers: 3,
            enrich_workers: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub adapter_secs: u64,
    pub content_fetch_secs: u64,
    pub enrich_secs: u64,
    pub notify_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            adapter_secs: 120,
            content_fetch_secs: 30,
            enrich_secs: 90,
            notify_secs: 10,
        }
    }
}

impl TimeoutsConfig {
    pub fn adapter(&self) -> Duration {
        Duration::from_secs(self.adapter_secs)
    }

    pub fn content_fetch(&self) -> Duration {
        Duration::from_secs(self.content_fetch_secs)
    }

    pub fn enrich(&self) -> Duration {
        Duration::from_secs(self.enrich_secs)
    }

    pub fn notify(&self) -> Duration {
        Duration::from_secs(self.notify_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    /// Running ledger rows older than this are relabelled error at admission.
    pub stale_after_minutes: i64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            stale_after_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpsertConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub model: String,
    pub custom_prompt: Option<String>,
    pub max_content_chars: usize,
    /// Previously stored, still-unenriched items per source swept into each run.
    pub backlog_limit: i64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-haiku-latest".to_string(),
            custom_prompt: None,
            max_content_chars: 12_000,
            backlog_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub user_agent: String,
    pub max_body_bytes: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            user_agent: "InflowBot/1.0".to_string(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load the config file if it exists, defaults otherwise. A file that exists
/// but does not parse is still an error.
pub fn load_or_default(path: &Path) -> Result<FileConfig> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!(path = %path.display(), "No config file, using defaults");
        Ok(FileConfig::default())
    }
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.concurrency.source_workers, 5);
        assert_eq!(config.concurrency.fetch_workers, 3);
        assert_eq!(config.concurrency.enrich_workers, 3);
        assert_eq!(config.runs.stale_after_minutes, 60);
        assert_eq!(config.upsert.max_attempts, 3);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = parse_config(
            r#"
            [concurrency]
            source_workers = 8

            [timeouts]
            enrich_secs = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.concurrency.source_workers, 8);
        assert_eq!(config.concurrency.enrich_workers, 3);
        assert_eq!(config.timeouts.enrich(), Duration::from_secs(15));
        assert_eq!(config.timeouts.adapter_secs, 120);
    }

    #[test]
    fn unknown_section_is_rejected() {
        assert!(parse_config("[clustering]\nbatch_size = 3").is_err());
    }

    #[test]
    fn shipped_sample_parses() {
        let config = parse_config(include_str!("../../../config/inflow.toml")).unwrap();
        assert_eq!(config.enrichment.backlog_limit, 50);
        assert_eq!(config.content.max_body_bytes, 2 * 1024 * 1024);
    }
}

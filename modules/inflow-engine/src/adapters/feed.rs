use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use inflow_common::{CandidateItem, SourceConfig};

use super::html_to_plain_text;
use crate::traits::FetchAdapter;

const DEFAULT_MAX_ITEMS: usize = 50;

/// RSS, Atom, and JSON Feed sources. The source's `url` is the feed url;
/// `connection.max_items` caps how many entries are taken (newest first).
pub struct FeedAdapter {
    client: reqwest::Client,
    user_agent: String,
}

impl FeedAdapter {
    pub fn new(user_agent: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build feed HTTP client")?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
        })
    }
}

fn max_items(source: &SourceConfig) -> usize {
    source
        .connection
        .get("max_items")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_ITEMS)
}

/// Parse a feed document into candidates, newest first. Entries without a
/// usable link are dropped.
pub fn parse_feed(bytes: &[u8], max_items: usize) -> Result<Vec<CandidateItem>> {
    let feed = feed_rs::parser::parse(bytes).context("Failed to parse RSS/Atom feed")?;
    let feed_title = feed.title.map(|t| t.content);

    let mut candidates: Vec<CandidateItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;

            let body = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .map(|html| html_to_plain_text(&html))
                .filter(|text| !text.is_empty());

            let mut candidate = CandidateItem::new(
                entry.title.map(|t| t.content).unwrap_or_default(),
                url,
            );
            candidate.raw_content = body;
            candidate.author = entry.authors.first().map(|p| p.name.clone());
            candidate.published_at = entry.published.or(entry.updated);
            if let Some(title) = &feed_title {
                candidate = candidate.with_metadata("feed_title", title.clone());
            }
            Some(candidate)
        })
        .collect();

    // Undated entries go last.
    candidates.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    candidates.truncate(max_items);
    Ok(candidates)
}

#[async_trait]
impl FetchAdapter for FeedAdapter {
    fn name(&self) -> &str {
        "feed"
    }

    fn validate(&self, source: &SourceConfig) -> std::result::Result<(), String> {
        match source.url.as_deref() {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
            Some(url) => Err(format!("feed url must be http(s): {url}")),
            None => Err("feed source has no url".to_string()),
        }
    }

    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<CandidateItem>> {
        let Some(feed_url) = source.url.as_deref() else {
            bail!("feed source has no url");
        };

        let resp = self
            .client
            .get(feed_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .context("Feed fetch failed")?;
        if !resp.status().is_success() {
            bail!("Feed responded {}", resp.status());
        }

        let bytes = resp.bytes().await.context("Failed to read feed body")?;
        let candidates = parse_feed(&bytes, max_items(source))?;

        info!(source = %source.name, items = candidates.len(), "Parsed feed");
        Ok(candidates)
    }
}

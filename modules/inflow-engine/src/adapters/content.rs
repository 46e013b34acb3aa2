use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::html_to_plain_text;
use crate::traits::ContentFetcher;

/// Fetches a page over HTTP and renders it to plain text.
pub struct HttpContentFetcher {
    client: reqwest::Client,
    user_agent: String,
    max_body_bytes: usize,
}

impl HttpContentFetcher {
    pub fn new(user_agent: impl Into<String>, max_body_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build content HTTP client")?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
            max_body_bytes,
        })
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch_content(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .with_context(|| format!("Page fetch failed: {url}"))?;
        if !resp.status().is_success() {
            bail!("Page responded {}: {url}", resp.status());
        }

        let bytes = resp.bytes().await.context("Failed to read page body")?;
        let body = &bytes[..bytes.len().min(self.max_body_bytes)];
        let html = String::from_utf8_lossy(body);
        let text = html_to_plain_text(&html);

        debug!(url, bytes = bytes.len(), chars = text.len(), "Fetched page content");
        Ok(text)
    }
}

//! Incremental work classification for one source's candidates.
//!
//! Candidates are keyed by canonical url and compared against what the store
//! already holds, so a rerun over unchanged input does no repeated work.

use std::collections::HashMap;

use inflow_common::{canonical_url, CandidateItem, Item};

#[derive(Debug, Default)]
pub struct Classified {
    /// Stored item already has content and enrichment. Not touched at all.
    pub skip: Vec<CandidateItem>,
    /// Neither the candidate nor the stored item has content.
    pub need_content: Vec<CandidateItem>,
    /// Has content from somewhere; goes straight to upsert.
    pub ready: Vec<CandidateItem>,
}

impl Classified {
    pub fn to_upsert(&self) -> usize {
        self.need_content.len() + self.ready.len()
    }
}

fn content_chars(candidate: &CandidateItem) -> usize {
    candidate
        .raw_content
        .as_deref()
        .map(|c| c.trim().chars().count())
        .unwrap_or(0)
}

/// Canonicalise urls, drop candidates without one, and collapse duplicates
/// within the batch keeping the richest content. First-seen order is kept.
pub fn normalize(candidates: Vec<CandidateItem>) -> Vec<CandidateItem> {
    let mut order: Vec<String> = Vec::new();
    let mut by_url: HashMap<String, CandidateItem> = HashMap::new();

    for mut candidate in candidates {
        let url = canonical_url(&candidate.url);
        if url.is_empty() {
            continue;
        }
        candidate.url = url.clone();
        match by_url.get(&url) {
            Some(existing) if content_chars(existing) >= content_chars(&candidate) => {}
            Some(_) => {
                by_url.insert(url, candidate);
            }
            None => {
                order.push(url.clone());
                by_url.insert(url, candidate);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|url| by_url.remove(&url))
        .collect()
}

/// Split normalized candidates against the stored items (keyed by url).
pub fn classify(candidates: Vec<CandidateItem>, stored: &HashMap<String, Item>) -> Classified {
    let mut classified = Classified::default();
    for candidate in candidates {
        let existing = stored.get(&candidate.url);
        if existing.is_some_and(Item::is_fully_processed) {
            classified.skip.push(candidate);
        } else if candidate.has_content() || existing.is_some_and(Item::has_content) {
            classified.ready.push(candidate);
        } else {
            classified.need_content.push(candidate);
        }
    }
    classified
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn stored(url: &str, content: Option<&str>, enriched: bool) -> (String, Item) {
        let mut candidate = CandidateItem::new("t", url);
        if let Some(c) = content {
            candidate = candidate.with_content(c);
        }
        let mut item = Item::from_candidate(&candidate, "src", Utc::now());
        item.is_enriched = enriched;
        (url.to_string(), item)
    }

    #[test]
    fn duplicates_collapse_to_the_richest_content() {
        let out = normalize(vec![
            CandidateItem::new("a", "https://x.example/p?utm_source=rss").with_content("short"),
            CandidateItem::new("b", "https://x.example/p").with_content("much longer body"),
            CandidateItem::new("c", "  "),
            CandidateItem::new("d", "https://x.example/q"),
        ]);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].url, "https://x.example/p");
        assert_eq!(out[0].raw_content.as_deref(), Some("much longer body"));
        assert_eq!(out[1].url, "https://x.example/q");
    }

    #[test]
    fn buckets_follow_stored_state() {
        let map: HashMap<String, Item> = [
            stored("https://x.example/done", Some("body"), true),
            stored("https://x.example/has-body", Some("body"), false),
            stored("https://x.example/empty", None, false),
        ]
        .into_iter()
        .collect();

        let classified = classify(
            vec![
                CandidateItem::new("t", "https://x.example/done"),
                CandidateItem::new("t", "https://x.example/has-body"),
                CandidateItem::new("t", "https://x.example/empty"),
                CandidateItem::new("t", "https://x.example/new").with_content("fresh"),
                CandidateItem::new("t", "https://x.example/new-bare"),
            ],
            &map,
        );

        let urls = |v: &Vec<CandidateItem>| v.iter().map(|c| c.url.clone()).collect::<Vec<_>>();
        assert_eq!(urls(&classified.skip), vec!["https://x.example/done"]);
        assert_eq!(
            urls(&classified.ready),
            vec!["https://x.example/has-body", "https://x.example/new"]
        );
        assert_eq!(
            urls(&classified.need_content),
            vec!["https://x.example/empty", "https://x.example/new-bare"]
        );
        assert_eq!(classified.to_upsert(), 4);
    }
}

//! Default collaborators: a feed adapter for `SourceKind::Feed` and an HTTP
//! content fetcher. Provider, web, and mailbox adapters are supplied by the
//! embedding application.

pub mod content;
pub mod feed;

pub use content::HttpContentFetcher;
pub use feed::FeedAdapter;

/// Plain text rendering of an HTML fragment. Input without markup passes
/// through unchanged.
pub fn html_to_plain_text(html: &str) -> String {
    if !html.contains('<') {
        return html.trim().to_string();
    }
    html2text::from_read(html.as_bytes(), 100)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markup_is_stripped() {
        let text = html_to_plain_text("<p>Council <b>votes</b> today</p>");
        assert!(text.contains("Council"));
        assert!(!text.contains("<p>"));
        assert_eq!(html_to_plain_text("  plain words "), "plain words");
    }
}

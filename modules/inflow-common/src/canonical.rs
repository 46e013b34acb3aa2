/// Query parameters that identify a click, not a document.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "utm_source", "utm_medium", "utm_campaign", "utm_term",
    "utm_content", "mc_cid", "mc_eid", "ref", "_hsenc", "_hsmi",
];

/// Canonical form of an item url: tracking parameters and fragment removed.
/// Unparseable input is returned trimmed but otherwise untouched.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = url::Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_and_fragment() {
        assert_eq!(
            canonical_url("https://news.example.com/a?utm_source=rss&id=7#comments"),
            "https://news.example.com/a?id=7"
        );
    }

    #[test]
    fn drops_empty_query() {
        assert_eq!(
            canonical_url("https://news.example.com/a?fbclid=abc"),
            "https://news.example.com/a"
        );
    }

    #[test]
    fn leaves_unparseable_input_alone() {
        assert_eq!(canonical_url("  not a url "), "not a url");
    }
}

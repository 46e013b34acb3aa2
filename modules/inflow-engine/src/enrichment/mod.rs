pub mod claude;

pub use claude::ClaudeEnrichment;

use inflow_common::EnrichmentRequest;

const SYSTEM_PROMPT: &str = "You annotate ingested articles for a news triage dashboard. \
Summarize neutrally in two to four sentences, give three to six short lowercase topical tags, \
rate importance from 1 (trivial) to 10 (critical) for a general reader, and pick a coarse \
category when one clearly applies.";

/// System prompt for a request, with any per-run instructions appended.
pub fn system_prompt(request: &EnrichmentRequest) -> String {
    match request.custom_prompt.as_deref().map(str::trim) {
        Some(extra) if !extra.is_empty() => format!("{SYSTEM_PROMPT}\n\nAdditional instructions:\n{extra}"),
        _ => SYSTEM_PROMPT.to_string(),
    }
}

/// User message for a request. Content is cut to `max_chars` characters.
pub fn user_prompt(request: &EnrichmentRequest, max_chars: usize) -> String {
    let content: String = request.content.chars().take(max_chars).collect();
    let mut prompt = format!("Source: {}\nTitle: {}\n", request.source_name, request.title);
    if let Some(category) = &request.category {
        prompt.push_str(&format!("Current category: {category}\n"));
    }
    prompt.push_str("\n---\n");
    prompt.push_str(&content);
    prompt
}

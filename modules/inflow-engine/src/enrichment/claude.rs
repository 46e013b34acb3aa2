//! Anthropic Messages API enrichment.
//!
//! Structured output comes from a forced tool call whose input schema is
//! derived from [`EnrichedFields`]. Every handle owns its own HTTP client.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use inflow_common::{EnrichedFields, EnrichmentRequest};

use super::{system_prompt, user_prompt};
use crate::traits::{Enricher, EnrichmentService};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const TOOL_NAME: &str = "record_enrichment";

// --- Wire types ---

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<WireMessage>,
    tools: Vec<ToolDefinition>,
    tool_choice: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[allow(dead_code)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse { input: serde_json::Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
}

/// JSON schema for the tool input, with the `$schema` and title noise removed.
pub fn enrichment_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(EnrichedFields);
    let mut value = serde_json::to_value(schema).unwrap_or_default();
    if let serde_json::Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
    }
    value
}

fn clamp(mut fields: EnrichedFields) -> EnrichedFields {
    fields.importance = fields.importance.clamp(1, 10);
    fields.tags = fields
        .tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    fields
}

/// Pull the forced tool call's input out of a response.
fn extract_fields(response: ChatResponse) -> Result<EnrichedFields> {
    for block in response.content {
        if let ContentBlock::ToolUse { input } = block {
            let fields: EnrichedFields =
                serde_json::from_value(input).context("Enrichment tool input did not match schema")?;
            return Ok(clamp(fields));
        }
    }
    Err(anyhow!("No structured output in Claude response"))
}

/// Stateless factory. Cheap to hold; each [`EnrichmentService::handle`] call
/// builds an independent client.
#[derive(Clone)]
pub struct ClaudeEnrichment {
    api_key: String,
    model: String,
    max_content_chars: usize,
}

impl ClaudeEnrichment {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_content_chars: usize) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_content_chars,
        }
    }
}

impl EnrichmentService for ClaudeEnrichment {
    fn handle(&self) -> Box<dyn Enricher> {
        Box::new(ClaudeEnricher {
            settings: self.clone(),
            http: reqwest::Client::new(),
        })
    }
}

struct ClaudeEnricher {
    settings: ClaudeEnrichment,
    http: reqwest::Client,
}

impl ClaudeEnricher {
    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.settings.api_key)?);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn request(&self, request: &EnrichmentRequest) -> ChatRequest {
        ChatRequest {
            model: self.settings.model.clone(),
            max_tokens: 1024,
            system: system_prompt(request),
            messages: vec![WireMessage {
                role: "user",
                content: user_prompt(request, self.settings.max_content_chars),
            }],
            tools: vec![ToolDefinition {
                name: TOOL_NAME,
                description: "Record the summary, tags, importance, and category for the article.",
                input_schema: enrichment_schema(),
            }],
            tool_choice: serde_json::json!({ "type": "tool", "name": TOOL_NAME }),
        }
    }
}

#[async_trait]
impl Enricher for ClaudeEnricher {
    async fn enrich(&self, request: EnrichmentRequest) -> Result<EnrichedFields> {
        let url = format!("{ANTHROPIC_API_URL}/messages");
        debug!(model = %self.settings.model, title = %request.title, "Claude enrichment request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&self.request(&request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Claude API error ({}): {}", status, error_text));
        }

        extract_fields(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_describes_enriched_fields() {
        let schema = enrichment_schema();
        let props = schema["properties"].as_object().unwrap();
        assert!(props.contains_key("summary"));
        assert!(props.contains_key("tags"));
        assert!(props.contains_key("importance"));
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn tool_use_block_is_decoded_and_clamped() {
        let response: ChatResponse = serde_json::from_value(serde_json::json!({
            "content": [
                { "type": "text", "text": "Here you go" },
                { "type": "tool_use", "id": "t1", "name": TOOL_NAME, "input": {
                    "summary": "A bridge closes.",
                    "tags": [" Transit ", ""],
                    "importance": 14,
                    "category": null
                }}
            ]
        }))
        .unwrap();

        let fields = extract_fields(response).unwrap();
        assert_eq!(fields.importance, 10);
        assert_eq!(fields.tags, vec!["transit"]);
    }

    #[test]
    fn response_without_tool_use_is_an_error() {
        let response: ChatResponse =
            serde_json::from_value(serde_json::json!({ "content": [{ "type": "text", "text": "no" }] }))
                .unwrap();
        assert!(extract_fields(response).is_err());
    }

    #[test]
    fn request_forces_the_tool() {
        let enricher = ClaudeEnrichment::new("sk-test", "claude-test", 100);
        let handle = ClaudeEnricher {
            settings: enricher,
            http: reqwest::Client::new(),
        };
        let body = serde_json::to_value(handle.request(&EnrichmentRequest {
            title: "t".into(),
            content: "c".into(),
            source_name: "s".into(),
            category: None,
            custom_prompt: None,
        }))
        .unwrap();
        assert_eq!(body["tool_choice"]["name"], TOOL_NAME);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}

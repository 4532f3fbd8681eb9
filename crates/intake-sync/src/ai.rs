//! LLM collaborator used for sub-scores and a short summary.
//!
//! The model only ever returns numbers on a 0-10 scale plus two short strings;
//! the composite is computed here, never by the model.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use intake_core::{ContentDetails, ContentItem, ContentKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

const SCORING_PROMPT: &str = r#"You review submissions for a curated directory of startups, funding programs and resources.

Score the item below on each factor from 0 to 10:
- relevance: how useful it is to founders and builders reading the directory
- quality: how complete, specific and credible the listing is
- urgency: how time-sensitive it is to act on now
Also score the kind-specific factors listed in the response schema.

Be critical. Score the text as written, not what the item could be.
Reply with a one-sentence summary and a one-sentence reasoning."#;

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl AiConfig {
    /// `None` unless `AI_API_KEY` is set and non-empty.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("AI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
        Some(Self {
            api_key,
            base_url: std::env::var("AI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout: Duration::from_secs(
                std::env::var("AI_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(20),
            ),
        })
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed completion: {0}")]
    Malformed(String),
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Returns the model's JSON answer, shaped by `response_schema`.
    async fn complete(&self, prompt: &str, response_schema: &JsonValue) -> Result<JsonValue, CompletionError>;
}

/// Validated model output. Every score is finite and within 0..=10.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiAssessment {
    pub relevance: f64,
    pub quality: f64,
    pub urgency: f64,
    pub sub_scores: BTreeMap<String, f64>,
    pub summary: String,
    pub reasoning: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawAssessment {
    relevance: f64,
    quality: f64,
    urgency: f64,
    #[serde(default)]
    sub_scores: BTreeMap<String, f64>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: Option<f64>,
}

fn bounded(name: &str, value: f64) -> Result<f64, CompletionError> {
    if !value.is_finite() {
        return Err(CompletionError::Malformed(format!("{name} is not a finite number")));
    }
    Ok(value.clamp(0.0, 10.0))
}

impl AiAssessment {
    pub fn from_json(value: JsonValue) -> Result<Self, CompletionError> {
        let raw: RawAssessment =
            serde_json::from_value(value).map_err(|e| CompletionError::Malformed(e.to_string()))?;
        let sub_scores = raw
            .sub_scores
            .into_iter()
            .map(|(name, score)| bounded(&name, score).map(|score| (name, score)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let confidence = match raw.confidence {
            Some(c) if c.is_finite() => Some(c.clamp(0.0, 1.0)),
            Some(_) => return Err(CompletionError::Malformed("confidence is not finite".into())),
            None => None,
        };
        Ok(Self {
            relevance: bounded("relevance", raw.relevance)?,
            quality: bounded("quality", raw.quality)?,
            urgency: bounded("urgency", raw.urgency)?,
            sub_scores,
            summary: raw.summary.trim().to_string(),
            reasoning: raw.reasoning.trim().to_string(),
            confidence,
        })
    }

    /// Mean of every sub-score, scaled to 0..=100.
    pub fn score(&self) -> f64 {
        let values = [self.relevance, self.quality, self.urgency]
            .into_iter()
            .chain(self.sub_scores.values().copied())
            .collect::<Vec<_>>();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        (mean * 10.0).clamp(0.0, 100.0)
    }
}

fn kind_factors(kind: ContentKind) -> [&'static str; 2] {
    match kind {
        ContentKind::Project => ["market_potential", "execution"],
        ContentKind::Funding => ["accessibility", "value"],
        ContentKind::Resource => ["actionability", "depth"],
    }
}

pub fn response_schema(kind: ContentKind) -> JsonValue {
    let score = json!({"type": "number", "minimum": 0, "maximum": 10});
    let factors = kind_factors(kind);
    let sub_properties = factors
        .iter()
        .map(|f| (f.to_string(), score.clone()))
        .collect::<serde_json::Map<_, _>>();
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["relevance", "quality", "urgency", "sub_scores", "summary", "reasoning", "confidence"],
        "properties": {
            "relevance": score,
            "quality": score,
            "urgency": score,
            "sub_scores": {
                "type": "object",
                "additionalProperties": false,
                "required": factors,
                "properties": sub_properties,
            },
            "summary": {"type": "string"},
            "reasoning": {"type": "string"},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
        }
    })
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn detail_lines(details: &ContentDetails) -> Vec<String> {
    let mut lines = Vec::new();
    let mut push = |label: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            lines.push(format!("{label}: {value}"));
        }
    };
    match details {
        ContentDetails::Project(p) => {
            push("Launched", p.launched_at.map(|d| d.date_naive().to_string()));
            push("Team size", p.team_size.map(|n| n.to_string()));
            push("Traction", p.traction.map(|n| n.to_string()));
            push("Links", Some(p.social_links.join(", ")));
            push("Tags", Some(p.tags.join(", ")));
        }
        ContentDetails::Funding(f) => {
            push("Organization", f.organization.clone());
            let currency = f.currency.clone().unwrap_or_default();
            let amount = match (f.amount_min, f.amount_max) {
                (Some(min), Some(max)) => Some(format!("{min}-{max} {currency}")),
                (Some(v), None) | (None, Some(v)) => Some(format!("{v} {currency}")),
                (None, None) => None,
            };
            push("Amount", amount.map(|a| a.trim().to_string()));
            push("Deadline", f.deadline.map(|d| d.to_string()));
            push("Eligibility", f.eligibility.clone());
        }
        ContentDetails::Resource(r) => {
            push("Published", r.published_at.map(|d| d.date_naive().to_string()));
            push("Author", r.author.clone());
            push("Engagement", r.engagement.map(|n| n.to_string()));
            push("Tags", Some(r.tags.join(", ")));
        }
    }
    lines
}

/// Bounded prompt: fixed instructions, title, truncated description and kind-specific facts.
pub fn build_prompt(item: &ContentItem, max_description_chars: usize) -> String {
    let mut prompt = format!(
        "{SCORING_PROMPT}\n\nKind: {}\nTitle: {}\nURL: {}\n\nDescription:\n{}\n",
        item.kind(),
        item.title(),
        item.url(),
        truncate_chars(item.description(), max_description_chars),
    );
    let details = detail_lines(item.details());
    if !details.is_empty() {
        prompt.push('\n');
        prompt.push_str(&details.join("\n"));
        prompt.push('\n');
    }
    prompt
}

/// OpenAI-compatible chat completions client using structured output.
pub struct HttpCompletionClient {
    client: Client,
    config: AiConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: JsonValue,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(config: AiConfig) -> Result<Self, CompletionError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str, response_schema: &JsonValue) -> Result<JsonValue, CompletionError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
            response_format: json!({
                "type": "json_schema",
                "json_schema": {"name": "content_assessment", "strict": true, "schema": response_schema},
            }),
        };
        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::Malformed("response has no message content".into()))?;
        serde_json::from_str(&content).map_err(|e| CompletionError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use intake_core::ProjectDetails;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(description: &str) -> ContentItem {
        ContentItem::new(
            "test",
            "Acme",
            "https://acme.io",
            description,
            ContentDetails::Project(ProjectDetails {
                team_size: Some(4),
                ..Default::default()
            }),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn assessment_clamps_scores_and_averages() {
        let assessment = AiAssessment::from_json(json!({
            "relevance": 12,
            "quality": 6,
            "urgency": -1,
            "sub_scores": {"market_potential": 8, "execution": 4},
            "summary": " Inventory sync. ",
            "reasoning": "Clear pitch.",
        }))
        .unwrap();
        assert_eq!(assessment.relevance, 10.0);
        assert_eq!(assessment.urgency, 0.0);
        assert_eq!(assessment.summary, "Inventory sync.");
        assert_eq!(assessment.confidence, None);
        assert!((assessment.score() - 56.0).abs() < 1e-9);
    }

    #[test]
    fn assessment_rejects_missing_scores() {
        let err = AiAssessment::from_json(json!({"relevance": 5, "summary": "x"})).unwrap_err();
        assert!(matches!(err, CompletionError::Malformed(_)));
    }

    #[test]
    fn schema_lists_kind_specific_factors() {
        let schema = response_schema(ContentKind::Funding);
        let required = &schema["properties"]["sub_scores"]["required"];
        assert_eq!(required, &json!(["accessibility", "value"]));
    }

    #[test]
    fn prompt_truncates_long_descriptions() {
        let prompt = build_prompt(&item(&"x".repeat(5_000)), 100);
        assert!(prompt.contains(&format!("{}...", "x".repeat(100))));
        assert!(!prompt.contains(&"x".repeat(101)));
        assert!(prompt.contains("Team size: 4"));
    }

    #[tokio::test]
    async fn http_client_reads_structured_content() {
        let server = MockServer::start().await;
        let answer = json!({
            "relevance": 7, "quality": 8, "urgency": 5,
            "sub_scores": {"market_potential": 6, "execution": 7},
            "summary": "Inventory sync for shops.", "reasoning": "Clear niche.", "confidence": 0.9
        });
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": answer.to_string()}}]
            })))
            .mount(&server)
            .await;

        let client = HttpCompletionClient::new(AiConfig {
            api_key: "test-key".into(),
            base_url: format!("{}/v1", server.uri()),
            model: "test-model".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let value = client
            .complete("prompt", &response_schema(ContentKind::Project))
            .await
            .unwrap();
        assert_eq!(value, answer);
    }

    #[tokio::test]
    async fn http_client_surfaces_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let client = HttpCompletionClient::new(AiConfig {
            api_key: "k".into(),
            base_url: server.uri(),
            model: "m".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let err = client.complete("p", &json!({})).await.unwrap_err();
        assert!(matches!(err, CompletionError::Status { status: 429, .. }));
    }
}

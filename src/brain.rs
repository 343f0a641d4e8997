//! Optional escalation: asks a chat-completion model for one action when
//! local planning cannot map the page.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EscalationConfig;
use crate::error::EscalationError;
use crate::profile::Masker;
use crate::types::{Action, FlowState, Snapshot, SUMMARY_TEXT_MAX_CHARS};

const SYSTEM_PROMPT: &str = r#"You help an automated job application agent that is stuck on a web page.
You receive a JSON summary of the page: its state, the interactive elements and the visible text.
Reply with ONE JSON object describing the next action, or the word null if nothing sensible can be done.

Available actions:
- {"action":"ClickButton","target":{"kind":"control","purpose":"next","text":"Continue"}}
- {"action":"FillInput","target":{"kind":"field","purpose":null,"text":"Field label"},"value":"text to type"}
- {"action":"SelectOption","target":{"kind":"select","purpose":null,"text":"Field label"},"value":"option text"}
- {"action":"ClickButton","target":{"kind":"toggle","purpose":null,"text":"Option label"}}
- {"action":"Navigate","direction":"back"}

Rules:
1. Return ONLY the JSON object. No markdown, no explanation.
2. Refer to elements by purpose and visible text exactly as they appear in the summary. Never invent selectors.
3. Never type passwords or invent personal data; prefer clicking controls that move the application forward."#;

/// Source of one extra candidate when local planning is stuck.
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn decide(&self, summary: &SnapshotSummary) -> Result<Option<Action>, EscalationError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ElementSummary {
    pub index: usize,
    pub kind: &'static str,
    pub purpose: Option<String>,
    pub text: String,
    pub required: bool,
    pub satisfied: bool,
}

/// What the decision service sees. Secrets are masked before it is built.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub url: String,
    pub title: String,
    pub state: FlowState,
    pub elements: Vec<ElementSummary>,
    pub page_text: String,
    pub api_endpoints: Vec<String>,
    pub last_error: Option<String>,
}

impl SnapshotSummary {
    pub fn new(snapshot: &Snapshot, state: FlowState, last_error: Option<&str>, masker: &Masker) -> Self {
        let elements = snapshot
            .elements
            .iter()
            .filter(|el| el.visible && !el.disabled)
            .map(|el| {
                let text = if el.is_control() {
                    el.text.clone()
                } else {
                    el.label.clone().unwrap_or_else(|| el.placeholder().unwrap_or_default().to_string())
                };
                ElementSummary {
                    index: el.index,
                    kind: el.variant_name(),
                    purpose: el.purpose.clone(),
                    text: masker.mask(&text),
                    required: el.required,
                    satisfied: !el.is_fillable() || snapshot.is_satisfied(el),
                }
            })
            .collect();
        let page_text: String = masker.mask(&snapshot.page_text).chars().take(SUMMARY_TEXT_MAX_CHARS).collect();
        Self {
            url: snapshot.url.clone(),
            title: snapshot.title.clone(),
            state,
            elements,
            page_text,
            api_endpoints: snapshot
                .network_records
                .iter()
                .filter(|r| r.is_api_endpoint())
                .map(|r| format!("{} {}", r.status, r.url))
                .collect(),
            last_error: last_error.map(|e| masker.mask(e)),
        }
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiDecider {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiDecider {
    pub fn from_config(config: &EscalationConfig) -> Result<Self, EscalationError> {
        if !config.enabled {
            return Err(EscalationError::Disabled("escalation.enabled is false".into()));
        }
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| EscalationError::Disabled(format!("{} not set in environment", config.api_key_env)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl DecisionService for OpenAiDecider {
    async fn decide(&self, summary: &SnapshotSummary) -> Result<Option<Action>, EscalationError> {
        let page = serde_json::to_string_pretty(summary).map_err(|e| EscalationError::Parse(e.to_string()))?;
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": page},
                ],
                "temperature": self.temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown API error").to_string();
            warn!(status = status.as_u16(), %message, "escalation request rejected");
            return Err(EscalationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EscalationError::Parse(format!("no content in reply: {body}")))?;
        debug!(reply = content, "escalation reply");
        parse_reply(content)
    }
}

/// Removes the markdown fences models like to add around JSON.
pub fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Decodes a model reply into at most one action. Uploads are refused since
/// file paths only ever come from the profile.
pub fn parse_reply(content: &str) -> Result<Option<Action>, EscalationError> {
    let cleaned = strip_fences(content);
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    let action: Action = serde_json::from_str(cleaned)
        .map_err(|e| EscalationError::Parse(format!("{e}: {cleaned}")))?;
    if matches!(action, Action::UploadFile { .. }) {
        return Err(EscalationError::Parse("upload actions are not accepted from escalation".into()));
    }
    Ok(Some(action))
}

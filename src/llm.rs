//! Language-model client.
//!
//! Everything that talks to an LLM goes through the [`LanguageModel`] trait:
//! the content router, the agentic search loop, and the synthesizers. The
//! production implementation is [`AnthropicClient`] (Messages API, non-streaming,
//! tool use supported). [`ScriptedModel`] replays canned completions and records
//! every request, so the pipelines can be exercised without network access.
//!
//! # Wire shape
//!
//! ```text
//! POST {base_url}/v1/messages
//! x-api-key: $ANTHROPIC_API_KEY
//! anthropic-version: 2023-06-01
//!
//! {model, max_tokens, system?, temperature?, tools?, messages: [{role, content: [block…]}]}
//! ```
//!
//! Content blocks are tagged by `type`: `text`, `tool_use`, `tool_result`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::LlmConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const JSON_SUFFIX: &str = "\n\nReturn ONLY valid JSON, no other text.";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("ANTHROPIC_API_KEY not set")]
    MissingApiKey,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Anthropic API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("unknown LLM provider: {0}")]
    UnknownProvider(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn blocks(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    /// Single user turn.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(text)],
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Concatenated text of every user message, for logging and tests.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .flat_map(|m| m.content.iter())
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: Some("end_turn".to_string()),
        }
    }

    pub fn tool_use(id: &str, name: &str, input: serde_json::Value) -> Self {
        Self {
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            stop_reason: Some("tool_use".to_string()),
        }
    }

    /// All text blocks joined.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// `(id, name, input)` of each tool_use block, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

/// Build the model named by `[llm].provider`.
pub fn create_model(config: &LlmConfig) -> Result<Box<dyn LanguageModel>, LlmError> {
    match config.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicClient::from_env(config)?)),
        other => Err(LlmError::UnknownProvider(other.to_string())),
    }
}

// ============ Anthropic ============

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSpec],
}

fn no_tools(tools: &&[ToolSpec]) -> bool {
    tools.is_empty()
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    pub fn from_env(config: &LlmConfig) -> Result<Self, LlmError> {
        let key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::MissingApiKey)?;
        Self::new(config, key)
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let body = MessagesBody {
            model: &self.model,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            messages: &request.messages,
            system: request.system.as_deref(),
            temperature: request.temperature,
            tools: &request.tools,
        };

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await;

            let response = match resp {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "Anthropic request failed");
                    last_err = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let completion: Completion = response.json().await?;
                return Ok(completion);
            }

            let text = response.text().await.unwrap_or_default();
            let err = LlmError::Api {
                status: status.as_u16(),
                body: text,
            };
            if status.as_u16() == 429 || status.is_server_error() {
                tracing::warn!(%status, attempt, "Anthropic retryable error");
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err
            .unwrap_or_else(|| LlmError::InvalidResponse("no attempts made".to_string())))
    }
}

// ============ Helpers ============

/// Strip a surrounding markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn strip_code_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// One-shot text completion.
pub async fn complete_text(
    model: &dyn LanguageModel,
    system: Option<&str>,
    prompt: &str,
    temperature: f64,
    max_tokens: u32,
) -> Result<String, LlmError> {
    let mut request = CompletionRequest::prompt(prompt)
        .with_temperature(temperature)
        .with_max_tokens(max_tokens);
    request.system = system.map(str::to_string);
    Ok(model.complete(request).await?.joined_text())
}

/// One-shot completion parsed as JSON at temperature 0.
pub async fn complete_json<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    system: Option<&str>,
    prompt: &str,
    max_tokens: u32,
) -> Result<T, LlmError> {
    let text = complete_text(
        model,
        system,
        &format!("{}{}", prompt, JSON_SUFFIX),
        0.0,
        max_tokens,
    )
    .await?;
    serde_json::from_str(strip_code_fences(&text))
        .map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, truncate(&text, 200))))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ============ Scripted ============

/// Replays queued completions in order, then the fallback (if any).
///
/// With no fallback, an empty queue yields `LlmError::InvalidResponse`,
/// which stands in for an unreachable model.
#[derive(Default)]
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Completion>>,
    fallback: Option<Completion>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every request with `completion`.
    pub fn repeating(completion: Completion) -> Self {
        Self {
            fallback: Some(completion),
            ..Self::default()
        }
    }

    /// Fails every request.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn push(&self, completion: Completion) -> &Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(completion);
        }
        self
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(Completion::text(text))
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request);
        }
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| LlmError::InvalidResponse("scripted model has no response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_content_block_wire_format() {
        let msg = Message::blocks(
            Role::User,
            vec![ContentBlock::ToolResult {
                tool_use_id: "t1".to_string(),
                content: "[]".to_string(),
                is_error: false,
            }],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "t1");
        assert!(json["content"][0].get("is_error").is_none());
    }

    #[test]
    fn test_parse_messages_response() {
        let json = serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "tu_1", "name": "grep_vault", "input": {"pattern": "Meta"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let completion: Completion = serde_json::from_value(json).unwrap();
        assert_eq!(completion.joined_text(), "Let me look.");
        let uses = completion.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "grep_vault");
        assert_eq!(uses[0].2["pattern"], "Meta");
    }

    #[test]
    fn test_request_body_omits_empty_tools() {
        let messages = vec![Message::user("hi")];
        let body = MessagesBody {
            model: "m",
            max_tokens: 10,
            messages: &messages,
            system: None,
            temperature: Some(0.0),
            tools: &[],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("system").is_none());
        assert_eq!(json["messages"][0]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_complete_json_strips_fences() {
        let model = ScriptedModel::new();
        model.push_text("```json\n{\"answer\": 42}\n```");
        let value: serde_json::Value = complete_json(&model, None, "q", 100).await.unwrap();
        assert_eq!(value["answer"], 42);

        let req = &model.requests()[0];
        assert!(req.user_text().ends_with("Return ONLY valid JSON, no other text."));
        assert_eq!(req.temperature, Some(0.0));
    }

    #[tokio::test]
    async fn test_complete_json_reports_garbage() {
        let model = ScriptedModel::repeating(Completion::text("not json"));
        let result: Result<serde_json::Value, _> = complete_json(&model, None, "q", 100).await;
        assert!(matches!(result, Err(LlmError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_failing_model() {
        let model = ScriptedModel::failing();
        assert!(model.complete(CompletionRequest::prompt("x")).await.is_err());
        assert_eq!(model.request_count(), 1);
    }

    #[test]
    fn test_unknown_provider() {
        let config = LlmConfig {
            provider: "nope".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            create_model(&config),
            Err(LlmError::UnknownProvider(_))
        ));
    }
}

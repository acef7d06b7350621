pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use confidant_config::LlmConfig;

pub use retry::{RetryPolicy, Retryable, backoff_delay, retry_async, sleep_cancellable, with_jitter};

// ── Errors ───────────────────────────────────────────────────────────────────

/// Failure of a single model call, classified for the retry wrapper.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Timeouts, connection resets, 429/5xx and empty responses.
    #[error("transient llm failure: {0}")]
    Transient(String),
    /// Anything retrying cannot fix: other 4xx, missing configuration,
    /// undecodable bodies.
    #[error("llm request rejected: {0}")]
    Permanent(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ── Chat types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Decoded arguments object; `{}` when the model sent something unparseable.
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that carries tool calls (and possibly some text).
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Render in the OpenAI `/chat/completions` message shape.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut msg = json!({
            "role": self.role,
            "content": self.content,
        });
        if !self.tool_calls.is_empty() {
            msg["tool_calls"] = self
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect();
        }
        if let Some(id) = &self.tool_call_id {
            msg["tool_call_id"] = json!(id);
        }
        msg
    }
}

/// First choice of a completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// The single "complete chat" primitive everything else is built on.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> Result<ChatResponse, LlmError>;
}

// ── OpenAI-compatible HTTP client ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(cfg: &LlmConfig) -> anyhow::Result<Self> {
        Self::new(&cfg.base_url, &cfg.model, &cfg.api_key, cfg.timeout())
    }
}

#[async_trait]
impl ChatCompleter for OpenAiCompatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> Result<ChatResponse, LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::Permanent(
                "api key missing; set CONFIDANT_LLM_API_KEY or llm.api_key".to_string(),
            ));
        }

        let mut payload = json!({
            "model": self.model,
            "messages": messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
        });
        if let Some(tools) = tools {
            payload["tools"] = tools.clone();
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| LlmError::Transient(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| LlmError::Transient(err.to_string()))?;
        if !status.is_success() {
            let detail = format!("status={} body={}", status.as_u16(), body.trim());
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                LlmError::Transient(detail)
            } else {
                LlmError::Permanent(detail)
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|err| LlmError::Permanent(format!("undecodable completion body: {err}")))?;
        parse_completion(&value)
    }
}

/// Pull the first choice out of a `/chat/completions` response body.
fn parse_completion(body: &serde_json::Value) -> Result<ChatResponse, LlmError> {
    let Some(message) = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
    else {
        return Err(LlmError::Transient("llm returned empty choices".to_string()));
    };

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|calls| calls.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.trim().to_string();
                    let arguments = match function.get("arguments") {
                        Some(serde_json::Value::String(raw)) => {
                            serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
                        }
                        Some(obj @ serde_json::Value::Object(_)) => obj.clone(),
                        _ => json!({}),
                    };
                    let id = call
                        .get("id")
                        .and_then(|id| id.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Some(ToolCall { id, name, arguments })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    debug!(content_len = content.len(), tool_calls = tool_calls.len(), "completion parsed");
    Ok(ChatResponse { content, tool_calls })
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract a JSON value from a model reply.
///
/// Tries, in order: a fenced ```` ```json ```` (or bare ```` ``` ````) block,
/// the outermost `{...}` span, then the outermost `[...]` span.  Returns
/// `None` when nothing parses as `T`.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    // Strategy 1: fenced blocks.
    for fence in ["```json", "```"] {
        if let Some(fence_start) = response.find(fence) {
            let after_fence = &response[fence_start + fence.len()..];
            if let Some(fence_end) = after_fence.find("```") {
                let json_str = after_fence[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    // Strategy 2: bare object or array spanning the first opener to the last closer.
    let trimmed = response.trim();
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if end > start {
                if let Ok(val) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(val);
                }
            }
        }
    }

    None
}

/// Truncate `s` to at most `max_chars` characters for log previews.
pub fn preview(s: &str, max_chars: usize) -> String {
    let s = s.trim();
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

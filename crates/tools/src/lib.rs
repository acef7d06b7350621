use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

// ── Tool specs ───────────────────────────────────────────────────────────────

/// JSON-friendly type hint for a tool parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub param_type: ParamType,
}

impl ToolParam {
    /// Convenience constructor for the most common case (required string param).
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            param_type: ParamType::String,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            param_type: ParamType::String,
        }
    }
}

/// Static metadata about a tool, used by the model to decide which tool to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// Generate the OpenAI-compatible `tools` array element for this tool.
    ///
    /// ```json
    /// {
    ///   "type": "function",
    ///   "function": {
    ///     "name": "HistorySearch",
    ///     "description": "...",
    ///     "parameters": {
    ///       "type": "object",
    ///       "properties": { ... },
    ///       "required": [...],
    ///       "additionalProperties": false
    ///     }
    ///   }
    /// }
    /// ```
    pub fn to_openai_tool_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();

        for p in &self.params {
            let type_str = match p.param_type {
                ParamType::String => "string",
                ParamType::Number => "number",
                ParamType::Integer => "integer",
                ParamType::Boolean => "boolean",
            };
            properties.insert(
                p.name.clone(),
                json!({ "type": type_str, "description": p.description }),
            );
            if p.required {
                required.push(p.name.clone());
            }
        }

        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": false,
                }
            }
        })
    }
}

/// Convert a slice of `ToolSpec` into the `tools` JSON array accepted by
/// `/chat/completions`.
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> serde_json::Value {
    serde_json::Value::Array(specs.iter().map(|s| s.to_openai_tool_schema()).collect())
}

// ── Built-in catalogue ───────────────────────────────────────────────────────

pub const HISTORY_SEARCH: &str = "HistorySearch";
pub const RECORD_SEARCH: &str = "RecordSearch";
pub const WEB_SEARCH: &str = "WebSearch";

/// The three tools the reply loop offers the model.
pub fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: HISTORY_SEARCH.to_string(),
            description: "Search recent conversation history by keyword and return matching \
                          messages with their session record ids."
                .to_string(),
            params: vec![ToolParam::required("keyword", "Search keyword.")],
        },
        ToolSpec {
            name: RECORD_SEARCH.to_string(),
            description: "Load the full text of a past session record by record_id.".to_string(),
            params: vec![ToolParam::required("record_id", "Session record id.")],
        },
        ToolSpec {
            name: WEB_SEARCH.to_string(),
            description: "Search the web and return a short list of results.".to_string(),
            params: vec![ToolParam::required("query", "Search query.")],
        },
    ]
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// Backends for the built-in tools.  Each returns a JSON payload that is fed
/// back to the model verbatim.
#[async_trait]
pub trait ToolHandlers: Send + Sync {
    async fn history_search(&self, keyword: &str) -> Result<serde_json::Value>;
    async fn record_search(&self, record_id: &str) -> Result<serde_json::Value>;
    async fn web_search(&self, query: &str) -> Result<serde_json::Value>;
}

/// First non-blank string among `keys` in an arguments object.
fn string_arg(args: &serde_json::Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| args.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Run the named tool and return its payload.
///
/// Never fails: unknown tools and handler errors are turned into
/// `{"error": ...}` payloads so the model can see what went wrong.
pub async fn dispatch_tool(
    handlers: &dyn ToolHandlers,
    name: &str,
    args: &serde_json::Value,
) -> serde_json::Value {
    let result = match name {
        HISTORY_SEARCH => {
            let keyword = string_arg(args, &["keyword", "query"]);
            handlers.history_search(&keyword).await
        }
        RECORD_SEARCH => {
            let record_id = string_arg(args, &["record_id", "recordId"]);
            handlers.record_search(&record_id).await
        }
        WEB_SEARCH => {
            let query = string_arg(args, &["query", "keyword"]);
            handlers.web_search(&query).await
        }
        other => return json!({ "error": format!("unknown tool: {other}") }),
    };

    result.unwrap_or_else(|err| {
        warn!(tool = name, ?err, "tool handler failed");
        json!({ "error": err.to_string() })
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

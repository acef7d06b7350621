use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// ── Agent ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// System prompt that defines the agent's voice.  Sent as the first
    /// message of every model call.
    pub persona: String,
    /// Zone used to render session start times in the prompt.
    ///
    /// Accepts fixed offsets (`+08:00`, `+0800`, `UTC+8`, `Z`) and IANA
    /// names (`Asia/Shanghai`).
    pub timezone: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Confidant".to_string(),
            persona: "You are Confidant, a warm and attentive companion. \
                      Keep replies short and conversational."
                .to_string(),
            timezone: "+08:00".to_string(),
        }
    }
}

// ── LLM ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible API root; `/chat/completions` is appended.
    /// Overridden by `CONFIDANT_LLM_BASE_URL`.
    pub base_url: String,
    pub model: String,
    /// Bearer token.  Overridden by `CONFIDANT_LLM_API_KEY`, then
    /// `OPENAI_API_KEY`.
    pub api_key: String,
    pub timeout_secs: u64,
    /// Total attempts per model call, including the first.
    pub max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            timeout_secs: 75,
            max_retries: 5,
            retry_initial_backoff_ms: 250,
            retry_max_backoff_ms: 5_000,
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity gap after which the next message opens a new session.
    pub gap_minutes: u64,
    /// Upper bound on messages loaded from the live session record.
    pub max_session_messages: usize,
    /// Activity string used when the history lookup fails.
    pub default_activity: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gap_minutes: 30,
            max_session_messages: 40,
            default_activity: "Active recently".to_string(),
        }
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Root directory for per-user state documents.
    /// Overridden by `CONFIDANT_STATE_DIR`.
    pub state_dir: String,
    pub max_facts: usize,
    pub max_summaries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            state_dir: ".confidant/state".to_string(),
            max_facts: 30,
            max_summaries: 30,
        }
    }
}

// ── Mood ─────────────────────────────────────────────────────────────────────

/// Baseline affect and the rate at which a turn's final mood relaxes back
/// toward it.
///
/// | Field              | Meaning                                         |
/// |--------------------|-------------------------------------------------|
/// | `baseline_valence` | Resting pleasantness                            |
/// | `baseline_arousal` | Resting energy                                  |
/// | `decay_per_hour`   | `k` in `baseline + (last - baseline)·e^(-k·h)`  |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MoodConfig {
    pub baseline_valence: f64,
    pub baseline_arousal: f64,
    pub decay_per_hour: f64,
}

impl Default for MoodConfig {
    fn default() -> Self {
        Self {
            baseline_valence: 0.2,
            baseline_arousal: 0.1,
            decay_per_hour: 0.25,
        }
    }
}

// ── Reply ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Lines beyond this count are dropped from a reply.
    pub max_lines: usize,
    /// Tool calls allowed per model turn before a final answer is forced.
    pub max_tool_calls: usize,
    pub line_delay_base_ms: u64,
    pub line_delay_per_char_ms: u64,
    pub line_delay_max_ms: u64,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_lines: 20,
            max_tool_calls: 3,
            line_delay_base_ms: 350,
            line_delay_per_char_ms: 60,
            line_delay_max_ms: 3_500,
        }
    }
}

// ── Directives ───────────────────────────────────────────────────────────────

/// Literal tokens the model uses to steer delivery.  They are matched
/// verbatim, so changing them requires matching changes to the persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectiveConfig {
    pub silence_token: String,
    pub want_more_token: String,
    pub proactive_prefix: String,
    pub sticker_prefix: String,
}

impl Default for DirectiveConfig {
    fn default() -> Self {
        Self {
            silence_token: "<SILENCE>".to_string(),
            want_more_token: "<WANT_MORE>".to_string(),
            proactive_prefix: "<PROACTIVE>".to_string(),
            sticker_prefix: "<STICKER>".to_string(),
        }
    }
}

// ── Proactive ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveConfig {
    /// Pending requests kept per user; the oldest are dropped on overflow.
    pub max_queue: usize,
    /// A request is dropped once it has been attempted this many times.
    pub max_attempts: u32,
    /// Minimum spacing between two attempts on the same request.
    pub retry_cooldown_secs: u64,
    /// Delay used when the directive asks for zero or less.
    pub default_delay_secs: u64,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Bridging summaries handed to the composer.
    pub summary_window: usize,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            max_queue: 16,
            max_attempts: 3,
            retry_cooldown_secs: 60,
            default_delay_secs: 180,
            min_delay_secs: 30,
            max_delay_secs: 24 * 60 * 60,
            summary_window: 12,
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// REST root for `POST /channels/{id}/messages`.  Overridden by
    /// `CONFIDANT_API_BASE`.
    pub api_base: String,
    pub access_token: String,
}

// ── Telemetry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub session: SessionConfig,
    pub memory: MemoryConfig,
    pub mood: MoodConfig,
    pub reply: ReplyConfig,
    pub directives: DirectiveConfig,
    pub proactive: ProactiveConfig,
    pub transport: TransportConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let non_empty = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(key) =
            non_empty("CONFIDANT_LLM_API_KEY").or_else(|| non_empty("OPENAI_API_KEY"))
        {
            self.llm.api_key = key;
        }
        if let Some(url) = non_empty("CONFIDANT_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = non_empty("CONFIDANT_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(dir) = non_empty("CONFIDANT_STATE_DIR") {
            self.memory.state_dir = dir;
        }
        if let Some(base) = non_empty("CONFIDANT_API_BASE") {
            self.transport.api_base = base;
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn session_gap(&self) -> Duration {
        Duration::from_secs(self.session.gap_minutes.saturating_mul(60))
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ProactiveConfig {
    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

//! Collaborator seams toward the chat platform: realtime delivery, the REST
//! fallback, sticker lookup, and session history.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use confidant_config::TransportConfig;

/// Realtime event name for a new outbound message.
pub const MESSAGE_CREATE_EVENT: &str = "message/create";
pub const STICKER_MESSAGE_TYPE: &str = "message/sticker";

/// One message as the history source reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMessage {
    pub id: String,
    #[serde(rename = "authorId")]
    pub author_id: String,
    #[serde(rename = "authorName")]
    pub author_name: String,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
    /// Session record the message belongs to, when known.
    #[serde(rename = "recordId")]
    pub record_id: String,
}

impl ChannelMessage {
    /// Display name, falling back to the author id, then `unknown`.
    pub fn author(&self) -> &str {
        [self.author_name.trim(), self.author_id.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("unknown")
    }
}

/// The live session (record) of a channel as seen by the history source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub record_id: String,
    pub start_at: Option<DateTime<Utc>>,
    pub messages: Vec<ChannelMessage>,
}

/// Push-style delivery (gateway socket or equivalent).
#[async_trait]
pub trait RealtimeEmitter: Send + Sync {
    async fn emit(&self, event: &str, payload: Value) -> Result<()>;
}

/// REST delivery, used as the fallback and for asynchronous sends.
#[async_trait]
pub trait MessagePoster: Send + Sync {
    async fn post_message(&self, channel_id: &str, content: &str) -> Result<()>;
    async fn post_sticker(&self, channel_id: &str, sticker_id: &str) -> Result<()>;
}

/// Maps human sticker names onto platform sticker ids.
#[async_trait]
pub trait StickerResolver: Send + Sync {
    /// `Ok(None)` when no sticker carries that name.
    async fn resolve(&self, name: &str) -> Result<Option<String>>;

    /// Names offered to the model in its instructions.
    async fn available_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Read access to channel history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// The current session record for `user_id` in `channel_id`, newest
    /// `max_messages` messages at most.
    async fn fetch_session(
        &self,
        channel_id: &str,
        user_id: &str,
        max_messages: usize,
    ) -> Result<SessionRecord>;

    /// Every message belonging to a past or present record.
    async fn record_search(
        &self,
        channel_id: &str,
        record_id: &str,
    ) -> Result<Vec<ChannelMessage>>;

    /// Keyword search over recent history.
    async fn history_search(&self, channel_id: &str, keyword: &str) -> Result<Vec<ChannelMessage>>;

    /// Short description of how often the user has been active lately.
    async fn activity_frequency(
        &self,
        channel_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<String>;
}

/// Optional web search backend for the `WebSearch` tool.
#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str) -> Result<Value>;
}

pub fn text_payload(channel_id: &str, content: &str) -> Value {
    json!({ "channelId": channel_id, "content": content })
}

pub fn sticker_payload(channel_id: &str, sticker_id: &str) -> Value {
    json!({
        "channelId": channel_id,
        "type": STICKER_MESSAGE_TYPE,
        "payload": { "stickerId": sticker_id, "stickerScope": "user" },
    })
}

/// `Active 3 days in the last 7`
pub fn format_activity_frequency(active_days: u32, window_days: u32) -> String {
    let window = if window_days == 0 { 7 } else { window_days };
    let unit = if active_days == 1 { "day" } else { "days" };
    format!("Active {active_days} {unit} in the last {window}")
}

// ── REST poster ──────────────────────────────────────────────────────────────

/// `POST {api_base}/channels/{channel_id}/messages`
#[derive(Debug, Clone)]
pub struct HttpMessagePoster {
    client: reqwest::Client,
    api_base: reqwest::Url,
    access_token: String,
}

impl HttpMessagePoster {
    pub fn new(api_base: &str, access_token: &str, timeout: Duration) -> Result<Self> {
        let api_base = api_base.trim();
        if api_base.is_empty() {
            bail!("transport.api_base is not configured");
        }
        let api_base = reqwest::Url::parse(api_base)
            .with_context(|| format!("invalid api base {api_base}"))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base,
            access_token: access_token.trim().to_string(),
        })
    }

    pub fn from_config(cfg: &TransportConfig) -> Result<Self> {
        Self::new(&cfg.api_base, &cfg.access_token, Duration::from_secs(30))
    }

    fn messages_url(&self, channel_id: &str) -> Result<reqwest::Url> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            bail!("missing channel id");
        }
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base cannot carry a path: {}", self.api_base))?
            .pop_if_empty()
            .extend(["channels", channel_id, "messages"]);
        Ok(url)
    }

    async fn post(&self, channel_id: &str, body: Value) -> Result<()> {
        let url = self.messages_url(channel_id)?;
        let mut request = self.client.post(url.clone()).json(&body);
        if !self.access_token.is_empty() {
            request = request.bearer_auth(&self.access_token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("status={} body={}", status.as_u16(), body.trim());
        }
        debug!(channel = channel_id, "message posted over REST");
        Ok(())
    }
}

#[async_trait]
impl MessagePoster for HttpMessagePoster {
    async fn post_message(&self, channel_id: &str, content: &str) -> Result<()> {
        self.post(channel_id, json!({ "content": content })).await
    }

    async fn post_sticker(&self, channel_id: &str, sticker_id: &str) -> Result<()> {
        let sticker_id = sticker_id.trim();
        if sticker_id.is_empty() {
            bail!("missing sticker id");
        }
        self.post(
            channel_id,
            json!({
                "type": STICKER_MESSAGE_TYPE,
                "payload": { "stickerId": sticker_id, "stickerScope": "user" },
            }),
        )
        .await
    }
}

//! In-memory collaborators shared by the runtime tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use confidant_llm::{ChatCompleter, ChatMessage, ChatResponse, LlmError, ToolCall};

use crate::transport::{ChannelMessage, HistorySource, SessionRecord, WebSearcher};

/// Replays a fixed list of responses in order and records every request.
pub(crate) struct ScriptedLlm {
    replies: Mutex<Vec<Result<ChatResponse, LlmError>>>,
    pub seen: Mutex<Vec<Vec<ChatMessage>>>,
    pub tools_offered: Mutex<Vec<bool>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Result<ChatResponse, LlmError>>) -> Self {
        let mut replies = replies;
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            seen: Mutex::new(Vec::new()),
            tools_offered: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(text(r))).collect())
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Vec<ChatMessage> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChatCompleter for ScriptedLlm {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&Value>,
    ) -> Result<ChatResponse, LlmError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.tools_offered.lock().unwrap().push(tools.is_some());
        self.replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err(LlmError::Permanent("script exhausted".into())))
    }
}

pub(crate) fn text(content: &str) -> ChatResponse {
    ChatResponse { content: content.to_string(), tool_calls: Vec::new() }
}

pub(crate) fn tool_call(content: &str, id: &str, name: &str, arguments: Value) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        tool_calls: vec![ToolCall { id: id.to_string(), name: name.to_string(), arguments }],
    }
}

/// Channel history kept in memory, keyed by record id.
#[derive(Default)]
pub(crate) struct MemoryHistory {
    pub live: Mutex<SessionRecord>,
    pub records: Mutex<HashMap<String, Vec<ChannelMessage>>>,
    pub activity: Mutex<Option<String>>,
    pub fail_records: bool,
}

impl MemoryHistory {
    pub fn with_record(record_id: &str, messages: Vec<ChannelMessage>) -> Self {
        let history = Self::default();
        history.records.lock().unwrap().insert(record_id.to_string(), messages);
        history
    }
}

#[async_trait]
impl HistorySource for MemoryHistory {
    async fn fetch_session(
        &self,
        _channel_id: &str,
        _user_id: &str,
        max_messages: usize,
    ) -> Result<SessionRecord> {
        let mut live = self.live.lock().unwrap().clone();
        let skip = live.messages.len().saturating_sub(max_messages);
        live.messages.drain(..skip);
        Ok(live)
    }

    async fn record_search(
        &self,
        _channel_id: &str,
        record_id: &str,
    ) -> Result<Vec<ChannelMessage>> {
        if self.fail_records {
            return Err(anyhow!("history backend unavailable"));
        }
        Ok(self.records.lock().unwrap().get(record_id).cloned().unwrap_or_default())
    }

    async fn history_search(
        &self,
        _channel_id: &str,
        keyword: &str,
    ) -> Result<Vec<ChannelMessage>> {
        let needle = keyword.to_lowercase();
        let records = self.records.lock().unwrap();
        let mut hits: Vec<ChannelMessage> = records
            .values()
            .flatten()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }

    async fn activity_frequency(
        &self,
        _channel_id: &str,
        _user_id: &str,
        _at: DateTime<Utc>,
    ) -> Result<String> {
        self.activity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("activity lookup unavailable"))
    }
}

pub(crate) struct StaticWeb;

#[async_trait]
impl WebSearcher for StaticWeb {
    async fn search(&self, query: &str) -> Result<Value> {
        Ok(json!({
            "query": query,
            "results": [{ "title": "Rust", "url": "https://www.rust-lang.org" }]
        }))
    }
}

pub(crate) fn message(id: &str, author: &str, content: &str, at: DateTime<Utc>) -> ChannelMessage {
    ChannelMessage {
        id: id.to_string(),
        author_id: author.to_string(),
        author_name: author.to_string(),
        content: content.to_string(),
        created_at: Some(at),
        record_id: String::new(),
    }
}

//! A console channel: stdin is the user, stdout is the bot.
//!
//! Messages are kept in memory and appended to a JSONL log so that
//! `confidant maintain` can read past records later.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::warn;

use confidant_runtime::{
    ChannelMessage, HistorySource, MessagePoster, RealtimeEmitter, SessionRecord,
    format_activity_frequency,
};

pub const LOCAL_CHANNEL_ID: &str = "local";
const ACTIVITY_WINDOW_DAYS: u32 = 7;

struct ChannelState {
    messages: Vec<ChannelMessage>,
    next_record: usize,
}

pub struct LocalChannel {
    log_path: Option<PathBuf>,
    bot_id: String,
    bot_name: String,
    gap: TimeDelta,
    state: Mutex<ChannelState>,
}

impl LocalChannel {
    pub fn new(bot_id: &str, bot_name: &str, gap: TimeDelta) -> Self {
        Self {
            log_path: None,
            bot_id: bot_id.to_string(),
            bot_name: bot_name.to_string(),
            gap,
            state: Mutex::new(ChannelState { messages: Vec::new(), next_record: 1 }),
        }
    }

    /// Load an existing log (if any) and append to it from now on.
    pub fn open(
        path: impl Into<PathBuf>,
        bot_id: &str,
        bot_name: &str,
        gap: TimeDelta,
    ) -> Result<Self> {
        let path = path.into();
        let mut channel = Self::new(bot_id, bot_name, gap);
        let messages = read_log(&path)?;
        {
            let state = channel.state.get_mut().unwrap_or_else(PoisonError::into_inner);
            state.next_record = messages
                .iter()
                .filter_map(|m| m.record_id.strip_prefix("rec-")?.parse::<usize>().ok())
                .max()
                .map_or(1, |n| n + 1);
            state.messages = messages;
        }
        channel.log_path = Some(path);
        Ok(channel)
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Record a message, opening a new record when the previous message is
    /// older than the session gap.
    pub fn push(
        &self,
        author_id: &str,
        author_name: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> ChannelMessage {
        let message = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let last = state.messages.last();
            let continues = last
                .and_then(|m| m.created_at.map(|t| (m.record_id.clone(), t)))
                .filter(|(_, t)| at - *t <= self.gap);
            let record_id = match continues {
                Some((record_id, _)) => record_id,
                None => {
                    let id = format!("rec-{}", state.next_record);
                    state.next_record += 1;
                    id
                }
            };
            let message = ChannelMessage {
                id: uuid::Uuid::new_v4().to_string(),
                author_id: author_id.to_string(),
                author_name: author_name.to_string(),
                content: content.to_string(),
                created_at: Some(at),
                record_id,
            };
            state.messages.push(message.clone());
            message
        };
        if let Err(err) = self.append_log(&message) {
            warn!(error = %err, "failed to append channel log");
        }
        message
    }

    fn append_log(&self, message: &ChannelMessage) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{}", serde_json::to_string(message)?)?;
        Ok(())
    }

    fn bot_says(&self, content: &str) {
        println!("{}> {content}", self.bot_name);
        self.push(&self.bot_id, &self.bot_name, content, Utc::now());
    }

    fn snapshot(&self) -> Vec<ChannelMessage> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).messages.clone()
    }
}

fn read_log(path: &Path) -> Result<Vec<ChannelMessage>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let mut messages = Vec::new();
    for (n, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ChannelMessage>(line) {
            Ok(m) => messages.push(m),
            Err(err) => warn!(line = n + 1, error = %err, "skipping malformed channel log line"),
        }
    }
    Ok(messages)
}

#[async_trait]
impl HistorySource for LocalChannel {
    async fn fetch_session(
        &self,
        _channel_id: &str,
        _user_id: &str,
        max_messages: usize,
    ) -> Result<SessionRecord> {
        let messages = self.snapshot();
        let Some(record_id) = messages.last().map(|m| m.record_id.clone()) else {
            return Ok(SessionRecord::default());
        };
        let in_record: Vec<ChannelMessage> =
            messages.into_iter().filter(|m| m.record_id == record_id).collect();
        let start_at = in_record.first().and_then(|m| m.created_at);
        let skip = if max_messages == 0 { 0 } else { in_record.len().saturating_sub(max_messages) };
        Ok(SessionRecord {
            record_id,
            start_at,
            messages: in_record.into_iter().skip(skip).collect(),
        })
    }

    async fn record_search(
        &self,
        _channel_id: &str,
        record_id: &str,
    ) -> Result<Vec<ChannelMessage>> {
        Ok(self.snapshot().into_iter().filter(|m| m.record_id == record_id).collect())
    }

    async fn history_search(
        &self,
        _channel_id: &str,
        keyword: &str,
    ) -> Result<Vec<ChannelMessage>> {
        let needle = keyword.to_lowercase();
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect())
    }

    async fn activity_frequency(
        &self,
        _channel_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<String> {
        let since = at - TimeDelta::days(i64::from(ACTIVITY_WINDOW_DAYS));
        let days: HashSet<_> = self
            .snapshot()
            .iter()
            .filter(|m| m.author_id == user_id)
            .filter_map(|m| m.created_at)
            .filter(|t| *t > since && *t <= at)
            .map(|t| t.date_naive())
            .collect();
        Ok(format_activity_frequency(days.len() as u32, ACTIVITY_WINDOW_DAYS))
    }
}

#[async_trait]
impl RealtimeEmitter for LocalChannel {
    async fn emit(&self, _event: &str, payload: Value) -> Result<()> {
        if let Some(sticker) = payload.pointer("/payload/stickerId").and_then(Value::as_str) {
            self.bot_says(&format!("[sticker {sticker}]"));
        } else if let Some(content) = payload.get("content").and_then(Value::as_str) {
            self.bot_says(content);
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePoster for LocalChannel {
    async fn post_message(&self, _channel_id: &str, content: &str) -> Result<()> {
        self.bot_says(content);
        Ok(())
    }

    async fn post_sticker(&self, _channel_id: &str, sticker_id: &str) -> Result<()> {
        self.bot_says(&format!("[sticker {sticker_id}]"));
        Ok(())
    }
}

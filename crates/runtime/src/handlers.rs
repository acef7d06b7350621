//! Backends for the built-in tools, scoped to one channel.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{Value, json};

use confidant_tools::ToolHandlers;

use crate::prompt::format_session_record;
use crate::transport::{HistorySource, WebSearcher};

/// Matches returned by one `HistorySearch` call.
const MAX_HISTORY_HITS: usize = 20;

pub struct ChannelTools {
    history: Arc<dyn HistorySource>,
    web: Option<Arc<dyn WebSearcher>>,
    channel_id: String,
}

impl ChannelTools {
    pub fn new(
        history: Arc<dyn HistorySource>,
        web: Option<Arc<dyn WebSearcher>>,
        channel_id: &str,
    ) -> Self {
        Self {
            history,
            web,
            channel_id: channel_id.trim().to_string(),
        }
    }
}

#[async_trait]
impl ToolHandlers for ChannelTools {
    async fn history_search(&self, keyword: &str) -> Result<Value> {
        if keyword.is_empty() {
            bail!("keyword is required");
        }
        let hits = self.history.history_search(&self.channel_id, keyword).await?;
        let skip = hits.len().saturating_sub(MAX_HISTORY_HITS);
        let results: Vec<Value> = hits
            .iter()
            .skip(skip)
            .map(|m| {
                json!({
                    "id": m.id,
                    "recordId": m.record_id,
                    "time": m.created_at.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    "author": m.author(),
                    "content": m.content.trim(),
                })
            })
            .collect();
        Ok(json!({ "keyword": keyword, "results": results }))
    }

    async fn record_search(&self, record_id: &str) -> Result<Value> {
        if record_id.is_empty() {
            bail!("record_id is required");
        }
        let messages = self.history.record_search(&self.channel_id, record_id).await?;
        Ok(json!({ "recordId": record_id, "text": format_session_record(&messages) }))
    }

    async fn web_search(&self, query: &str) -> Result<Value> {
        let Some(web) = &self.web else {
            bail!("web search is not configured");
        };
        if query.is_empty() {
            bail!("query is required");
        }
        web.search(query).await
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mood::Mood;

/// Per-user session bookkeeping, rewritten after every state-affecting step
/// of a turn and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    /// Session start rendered in the configured zone, `%Y-%m-%d %H:%M`.
    pub session_start_datetime: String,
    /// `~5m`, `~2h 10m`, or `unknown` before the first message.
    pub time_since_last_message: String,
    pub user_activity_frequency: String,

    pub initial_mood: Mood,
    /// Set only when the model emits a `final_mood` marker.
    pub final_mood: Option<Mood>,
    /// `None` until first saved; filled from configuration on load.
    pub baseline_mood: Option<Mood>,

    #[serde(rename = "recordId")]
    pub record_id: String,
    #[serde(rename = "startAt")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastMessageAt")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(rename = "channelId")]
    pub channel_id: String,

    /// Advances only after a summary for that record has been stored, so a
    /// failed finalize is retried at the next rollover.
    #[serde(rename = "lastSummarizedRecordId")]
    pub last_summarized_record_id: String,
    #[serde(rename = "lastFactRecordId")]
    pub last_fact_record_id: String,
    #[serde(rename = "lastFactProcessedAt")]
    pub last_fact_processed_at: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    /// True when the current record still needs an end-of-session summary.
    pub fn needs_finalize(&self) -> bool {
        !self.record_id.is_empty()
            && !self.channel_id.is_empty()
            && self.last_summarized_record_id != self.record_id
    }

    /// True when messages arrived on the current record after the last
    /// fact-extraction pass.
    pub fn has_unprocessed_facts(&self) -> bool {
        if self.last_fact_record_id.trim() != self.record_id.trim() {
            return true;
        }
        match (self.last_fact_processed_at, self.last_message_at) {
            (Some(processed), Some(last)) => last > processed,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

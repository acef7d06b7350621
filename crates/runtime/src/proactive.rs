//! Delayed, agent-initiated follow-ups.
//!
//! A reply may carry a proactive directive.  It becomes a request in the
//! user's queue with a due time.  Each maintenance or turn pass hands due
//! requests to the model, which either composes one message or answers
//! with the silence token.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use confidant_config::{DirectiveConfig, ProactiveConfig};
use confidant_llm::{ChatMessage, preview};
use confidant_memory::{SessionMetadata, SummariesFile, extract_final_mood, summaries_between};

use crate::directives::{ProactiveDirective, is_silence, parse_reply};
use crate::orchestrator::ReplyOrchestrator;
use crate::outbound::Outbound;
use crate::prompt::{
    ProactivePromptContext, format_session_record, persona_or_default, proactive_prompt,
};
use crate::transport::HistorySource;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveRequest {
    pub id: String,
    #[serde(rename = "addedAt")]
    pub added_at: Option<DateTime<Utc>>,
    #[serde(rename = "requestAt")]
    pub request_at: Option<DateTime<Utc>>,
    pub reason: String,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    #[serde(rename = "recordId")]
    pub record_id: String,
    pub attempts: u32,
    #[serde(rename = "lastAttemptAt")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl ProactiveRequest {
    /// A request without a due time is treated as due immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.request_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveQueue {
    pub requests: Vec<ProactiveRequest>,
}

impl ProactiveQueue {
    pub fn has_due(&self, now: DateTime<Utc>) -> bool {
        self.requests.iter().any(|r| r.is_due(now))
    }
}

/// `seconds + minutes`, the default when that is zero or less, then
/// clamped to `[min, max]`.
pub fn effective_delay(directive: &ProactiveDirective, cfg: &ProactiveConfig) -> TimeDelta {
    let requested = directive
        .delay_seconds
        .saturating_add(directive.delay_minutes.saturating_mul(60));
    let secs = if requested <= 0 {
        cfg.default_delay_secs as i64
    } else {
        requested
    };
    let secs = secs.max(cfg.min_delay_secs as i64).min(cfg.max_delay_secs as i64);
    TimeDelta::seconds(secs)
}

/// `None` when either id is missing.
pub fn build_request(
    now: DateTime<Utc>,
    channel_id: &str,
    record_id: &str,
    directive: &ProactiveDirective,
    cfg: &ProactiveConfig,
) -> Option<ProactiveRequest> {
    let (channel_id, record_id) = (channel_id.trim(), record_id.trim());
    if channel_id.is_empty() || record_id.is_empty() {
        return None;
    }
    Some(ProactiveRequest {
        added_at: Some(now),
        request_at: Some(now + effective_delay(directive, cfg)),
        reason: directive.reason.trim().to_string(),
        channel_id: channel_id.to_string(),
        record_id: record_id.to_string(),
        ..ProactiveRequest::default()
    })
}

/// Append `request`, then keep only the newest `max` entries (`0` keeps
/// everything).
pub fn append_request(
    now: DateTime<Utc>,
    mut queue: ProactiveQueue,
    mut request: ProactiveRequest,
    max: usize,
) -> ProactiveQueue {
    if request.id.trim().is_empty() {
        request.id = Uuid::new_v4().to_string();
    }
    if request.added_at.is_none() {
        request.added_at = Some(now);
    }
    queue.requests.push(request);
    if max > 0 && queue.requests.len() > max {
        let overflow = queue.requests.len() - max;
        queue.requests.drain(..overflow);
        debug!(dropped = overflow, max, "proactive queue trimmed");
    }
    queue
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

/// What became of one due request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Sent,
    /// The model chose silence or produced nothing.
    Skipped,
    /// Something failed; the request stays queued.
    Retry,
}

/// The live session, if any, at dispatch time.
#[derive(Debug, Clone, Default)]
struct CurrentSession {
    channel_id: String,
    record_id: String,
    start_at: Option<DateTime<Utc>>,
    text: String,
}

pub struct ProactiveDispatcher<'a> {
    pub orchestrator: &'a ReplyOrchestrator,
    pub history: &'a dyn HistorySource,
    pub outbound: &'a Outbound,
    pub cfg: &'a ProactiveConfig,
    pub directives: &'a DirectiveConfig,
    pub persona: &'a str,
    pub max_session_messages: usize,
}

impl ProactiveDispatcher<'_> {
    /// One pass over `queue`; returns the queue to persist.
    pub async fn run(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        queue: ProactiveQueue,
        meta: &SessionMetadata,
        summaries: &SummariesFile,
    ) -> ProactiveQueue {
        if !queue.has_due(now) {
            return queue;
        }
        let current = self.current_session(user_id, meta).await;
        let cooldown = TimeDelta::seconds(self.cfg.retry_cooldown_secs as i64);

        let mut kept = Vec::with_capacity(queue.requests.len());
        for mut req in queue.requests {
            if !req.is_due(now) {
                kept.push(req);
                continue;
            }
            if req.attempts >= self.cfg.max_attempts {
                info!(
                    user = user_id,
                    id = %req.id,
                    attempts = req.attempts,
                    "proactive request dropped after max attempts"
                );
                continue;
            }
            if req.last_attempt_at.is_some_and(|last| now - last < cooldown) {
                kept.push(req);
                continue;
            }
            req.attempts += 1;
            req.last_attempt_at = Some(now);

            match self.attempt(user_id, now, &req, &current, summaries).await {
                AttemptOutcome::Sent | AttemptOutcome::Skipped => {}
                AttemptOutcome::Retry => kept.push(req),
            }
        }
        ProactiveQueue { requests: kept }
    }

    async fn current_session(&self, user_id: &str, meta: &SessionMetadata) -> CurrentSession {
        let channel_id = meta.channel_id.trim();
        if channel_id.is_empty() {
            return CurrentSession::default();
        }
        match self
            .history
            .fetch_session(channel_id, user_id, self.max_session_messages)
            .await
        {
            Ok(record) if !record.messages.is_empty() => CurrentSession {
                channel_id: channel_id.to_string(),
                record_id: record.record_id,
                start_at: record.start_at,
                text: format_session_record(&record.messages),
            },
            Ok(_) => CurrentSession::default(),
            Err(err) => {
                debug!(
                    user = user_id,
                    channel = channel_id,
                    %err,
                    "current session unavailable for proactive pass"
                );
                CurrentSession::default()
            }
        }
    }

    async fn attempt(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        req: &ProactiveRequest,
        current: &CurrentSession,
        summaries: &SummariesFile,
    ) -> AttemptOutcome {
        let record = match self.history.record_search(&req.channel_id, &req.record_id).await {
            Ok(messages) => format_session_record(&messages),
            Err(err) => {
                warn!(
                    user = user_id,
                    channel = %req.channel_id,
                    record = %req.record_id,
                    attempt = req.attempts,
                    %err,
                    "proactive record load failed"
                );
                return AttemptOutcome::Retry;
            }
        };

        let window_start = req.added_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let window_end = current.start_at.unwrap_or(now);
        let bridging = summaries_between(
            &summaries.summaries,
            window_start,
            window_end,
            self.cfg.summary_window,
        );

        let prompt = proactive_prompt(
            &ProactivePromptContext {
                now,
                added_at: req.added_at.unwrap_or(now),
                request_at: req.request_at.unwrap_or(now),
                reason: &req.reason,
                record_id: &req.record_id,
                current_channel_id: &current.channel_id,
                current_record_id: &current.record_id,
                scheduled_record_text: &record,
                intermediate_summaries: &bridging,
                current_record_text: &current.text,
            },
            self.directives,
        );
        let messages = [
            ChatMessage::system(persona_or_default(self.persona)),
            ChatMessage::user(prompt),
        ];

        let composed = match self.orchestrator.complete_text(&messages).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    user = user_id,
                    channel = %req.channel_id,
                    record = %req.record_id,
                    attempt = req.attempts,
                    %err,
                    "proactive compose failed"
                );
                return AttemptOutcome::Retry;
            }
        };

        let (without_mood, _) = extract_final_mood(&composed);
        let (clean, _) = parse_reply(&without_mood, self.directives);
        if clean.is_empty() || is_silence(&clean, &self.directives.silence_token) {
            info!(
                user = user_id,
                channel = %req.channel_id,
                record = %req.record_id,
                "proactive skipped by model"
            );
            return AttemptOutcome::Skipped;
        }

        match self.outbound.send_reply_rest(&req.channel_id, &clean).await {
            Ok(lines) => {
                info!(
                    user = user_id,
                    channel = %req.channel_id,
                    record = %req.record_id,
                    lines,
                    reason = %preview(&req.reason, 160),
                    preview = %preview(&clean, 160),
                    "proactive sent"
                );
                AttemptOutcome::Sent
            }
            Err(err) => {
                warn!(
                    user = user_id,
                    channel = %req.channel_id,
                    record = %req.record_id,
                    attempt = req.attempts,
                    %err,
                    "proactive send failed"
                );
                AttemptOutcome::Retry
            }
        }
    }
}

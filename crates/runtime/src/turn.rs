//! One inbound message, start to finish, under the user's lock.
//!
//! Order of a turn:
//! 1. session timing, and a finalize of the previous record on rollover
//! 2. live session fetch, metadata refresh, metadata save
//! 3. tool-augmented model reply, final mood save
//! 4. directive parsing, paced send, proactive enqueue
//! 5. at most one continuation when the model asked for it
//! 6. on-demand fact extraction, then a proactive dispatch pass

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use confidant_config::AppConfig;
use confidant_llm::{ChatCompleter, ChatMessage, RetryPolicy, preview};
use confidant_memory::{
    Document, FactsFile, SessionMetadata, StateStore, SummariesFile, append_summary, extract_facts,
    summarize_record, touch_facts, upsert_facts,
};

use crate::directives::{ReplyDirectives, parse_reply};
use crate::handlers::ChannelTools;
use crate::locks::UserLocks;
use crate::orchestrator::{PreludeSink, ReplyOrchestrator};
use crate::outbound::Outbound;
use crate::proactive::{ProactiveDispatcher, ProactiveQueue, append_request, build_request};
use crate::prompt::{
    build_context_prompt, build_history_messages, developer_instructions, format_session_record,
    persona_or_default,
};
use crate::session::{
    SessionObservation, Zone, activity_refresh_needed, apply_activity, apply_timing,
    update_session_state,
};
use crate::transport::{HistorySource, MessagePoster, RealtimeEmitter, StickerResolver, WebSearcher};

/// User nudge sent when the model asks to keep talking.
pub const CONTINUE_NUDGE: &str = "(you want to say more)";

/// A message from a user, as delivered by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub user_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub content: String,
    /// Platform timestamp; the local clock is used when absent.
    pub sent_at: Option<DateTime<Utc>>,
}

/// Everything outside the process a controller talks to.
pub struct Collaborators {
    pub llm: Arc<dyn ChatCompleter>,
    pub history: Arc<dyn HistorySource>,
    pub poster: Arc<dyn MessagePoster>,
    pub emitter: Option<Arc<dyn RealtimeEmitter>>,
    pub stickers: Option<Arc<dyn StickerResolver>>,
    pub web: Option<Arc<dyn WebSearcher>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    pub record_id: String,
    pub new_session: bool,
    /// Clean text of the first reply (directives stripped).
    pub reply: String,
    pub continued: bool,
    pub proactive_queued: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub users: usize,
    pub finalized: usize,
    pub fact_passes: usize,
}

/// True when the user explicitly asks for something to be remembered.
pub fn wants_remember(content: &str) -> bool {
    let s = content.trim();
    !s.is_empty() && (s.contains("记住") || s.to_lowercase().contains("remember"))
}

struct ChannelPrelude<'a> {
    outbound: &'a Outbound,
    channel_id: &'a str,
}

#[async_trait]
impl PreludeSink for ChannelPrelude<'_> {
    async fn prelude(&self, text: &str) -> Result<()> {
        self.outbound.send_prelude(self.channel_id, text).await
    }
}

pub struct TurnController {
    config: AppConfig,
    bot_user_id: String,
    zone: Zone,
    store: StateStore,
    history: Arc<dyn HistorySource>,
    web: Option<Arc<dyn WebSearcher>>,
    orchestrator: ReplyOrchestrator,
    outbound: Outbound,
    locks: UserLocks,
    token: CancellationToken,
}

impl TurnController {
    pub fn new(
        config: AppConfig,
        bot_user_id: &str,
        collab: Collaborators,
        token: CancellationToken,
    ) -> Self {
        let store = StateStore::open(&config.memory.state_dir, &config.mood);
        Self::with_store(config, bot_user_id, collab, store, token)
    }

    pub fn with_store(
        config: AppConfig,
        bot_user_id: &str,
        collab: Collaborators,
        store: StateStore,
        token: CancellationToken,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.llm);
        let orchestrator = ReplyOrchestrator::new(
            collab.llm,
            policy,
            config.reply.max_tool_calls,
            &config.directives,
            token.clone(),
        );
        let mut outbound =
            Outbound::new(collab.poster, &config.reply, &config.directives, token.clone());
        if let Some(emitter) = collab.emitter {
            outbound = outbound.with_emitter(emitter);
        }
        if let Some(stickers) = collab.stickers {
            outbound = outbound.with_stickers(stickers);
        }
        Self {
            zone: Zone::parse(&config.agent.timezone),
            bot_user_id: bot_user_id.trim().to_string(),
            store,
            history: collab.history,
            web: collab.web,
            orchestrator,
            outbound,
            locks: UserLocks::new(),
            token,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn gap(&self) -> TimeDelta {
        TimeDelta::minutes(self.config.session.gap_minutes as i64)
    }

    // ── Turn ─────────────────────────────────────────────────────────────

    pub async fn handle_message(&self, msg: &InboundMessage) -> Result<TurnOutcome> {
        let user_id = msg.user_id.trim();
        let channel_id = msg.channel_id.trim();
        if user_id.is_empty() || channel_id.is_empty() {
            anyhow::bail!("inbound message without user or channel id");
        }
        let _guard = self.locks.acquire(user_id).await;
        let now = msg.sent_at.unwrap_or_else(Utc::now);
        debug!(
            user = user_id,
            channel = channel_id,
            message = %msg.message_id,
            content = %preview(&msg.content, 160),
            "inbound message"
        );

        let mut meta = self.store.load_metadata(user_id).await?;
        let mut facts = self.store.load_facts(user_id).await?;
        let mut summaries = self.store.load_summaries(user_id).await?;

        let timing = apply_timing(&mut meta, channel_id, now, self.gap());
        if timing.new_session && meta.needs_finalize() {
            info!(
                user = user_id,
                prev_record = %meta.record_id,
                last_summarized = %meta.last_summarized_record_id,
                "session rollover detected"
            );
            if let Err(err) = self
                .finalize_record(user_id, &mut meta, &mut facts, &mut summaries, now)
                .await
            {
                warn!(
                    user = user_id,
                    err = %format!("{err:#}"),
                    "finalize previous record failed, will retry at next rollover"
                );
            }
        }

        let record = self
            .history
            .fetch_session(channel_id, user_id, self.config.session.max_session_messages)
            .await
            .with_context(|| format!("failed to load session for {user_id} in {channel_id}"))?;
        if record.record_id.trim().is_empty() {
            warn!(
                user = user_id,
                channel = channel_id,
                "history returned a session without a record id"
            );
        }
        let start_at = record.start_at.unwrap_or(now);
        info!(
            user = user_id,
            channel = channel_id,
            record = %record.record_id,
            messages = record.messages.len(),
            new_session = timing.new_session,
            persona = %preview(&self.config.agent.persona, 100),
            "session record loaded"
        );

        if activity_refresh_needed(&meta, &timing.prev_record_id, &record.record_id) {
            let lookup = self.history.activity_frequency(channel_id, user_id, start_at);
            let fetched = match lookup.await {
                Ok(freq) => Some(freq),
                Err(err) => {
                    debug!(user = user_id, %err, "activity lookup failed");
                    None
                }
            };
            apply_activity(&mut meta, fetched, &self.config.session.default_activity);
        }
        let obs = SessionObservation { channel_id, record_id: &record.record_id, start_at, now };
        update_session_state(&mut meta, &obs, &timing, &self.zone, &self.config.mood);
        self.store.save_metadata(user_id, &meta).await?;

        let sticker_names = match self.outbound.stickers() {
            Some(resolver) => resolver.available_names().await.unwrap_or_else(|err| {
                warn!(user = user_id, %err, "sticker catalogue unavailable");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let context = build_context_prompt(
            &developer_instructions(&self.config.directives, &sticker_names),
            &meta,
            &facts,
            &summaries,
        );
        let history = build_history_messages(&record.messages, &self.bot_user_id, &self.zone);
        let mut messages = Vec::with_capacity(history.len() + 4);
        messages.push(ChatMessage::system(persona_or_default(&self.config.agent.persona)));
        messages.push(ChatMessage::user(context));
        messages.extend(history);
        debug!(
            user = user_id,
            messages = messages.len(),
            facts = facts.facts.len(),
            summaries = summaries.summaries.len(),
            "prompt prepared"
        );

        let (clean, directives) =
            self.reply_once(user_id, channel_id, &mut meta, messages.clone()).await?;
        let mut outcome = TurnOutcome {
            record_id: record.record_id.clone(),
            new_session: timing.new_session,
            reply: clean.clone(),
            ..TurnOutcome::default()
        };
        outcome.proactive_queued += self
            .enqueue_proactive(user_id, channel_id, &record.record_id, now, &directives)
            .await;

        if directives.want_more {
            outcome.continued = true;
            if !clean.is_empty() {
                messages.push(ChatMessage::assistant(clean.as_str()));
            }
            messages.push(ChatMessage::user(CONTINUE_NUDGE));
            let (_, more) = self.reply_once(user_id, channel_id, &mut meta, messages).await?;
            if more.want_more {
                debug!(user = user_id, "second continuation request ignored");
            }
            outcome.proactive_queued += self
                .enqueue_proactive(user_id, channel_id, &record.record_id, now, &more)
                .await;
        }

        if wants_remember(&msg.content) {
            let session_text = format_session_record(&record.messages);
            self.merge_facts(user_id, &session_text, &mut facts, now, "on-demand").await;
        }

        self.dispatch_proactive(user_id, now).await;
        Ok(outcome)
    }

    /// One model reply: run the tool loop, store the mood, send the text.
    async fn reply_once(
        &self,
        user_id: &str,
        channel_id: &str,
        meta: &mut SessionMetadata,
        messages: Vec<ChatMessage>,
    ) -> Result<(String, ReplyDirectives)> {
        let tools = ChannelTools::new(self.history.clone(), self.web.clone(), channel_id);
        let prelude = ChannelPrelude { outbound: &self.outbound, channel_id };
        let reply = self
            .orchestrator
            .chat_with_tools(messages, &tools, Some(&prelude))
            .await
            .with_context(|| format!("model reply failed for {user_id}"))?;

        if let Some(mood) = reply.final_mood {
            meta.final_mood = Some(mood);
            self.store.save_metadata(user_id, meta).await?;
        }

        let (clean, directives) = parse_reply(&reply.text, &self.config.directives);
        self.outbound
            .send_reply(channel_id, &clean, directives.sticker.as_ref())
            .await?;
        Ok((clean, directives))
    }

    async fn enqueue_proactive(
        &self,
        user_id: &str,
        channel_id: &str,
        record_id: &str,
        now: DateTime<Utc>,
        directives: &ReplyDirectives,
    ) -> usize {
        let Some(directive) = &directives.proactive else {
            return 0;
        };
        let built = build_request(now, channel_id, record_id, directive, &self.config.proactive);
        let Some(request) = built else {
            warn!(user = user_id, "proactive directive ignored: missing channel or record id");
            return 0;
        };

        let result: Result<()> = async {
            let queue: ProactiveQueue = self.store.load(user_id, Document::ProactiveQueue).await?;
            let queue =
                append_request(now, queue, request.clone(), self.config.proactive.max_queue);
            self.store.save(user_id, Document::ProactiveQueue, &queue).await
        }
        .await;
        match result {
            Ok(()) => {
                info!(
                    user = user_id,
                    channel = channel_id,
                    record = record_id,
                    at = ?request.request_at,
                    reason = %preview(&request.reason, 160),
                    "proactive queued"
                );
                1
            }
            Err(err) => {
                warn!(user = user_id, %err, "failed to queue proactive request");
                0
            }
        }
    }

    // ── Memory ───────────────────────────────────────────────────────────

    /// Summarize and mine facts from the record in `meta`.  The summarized
    /// marker only advances once the summary is stored.
    async fn finalize_record(
        &self,
        user_id: &str,
        meta: &mut SessionMetadata,
        facts: &mut FactsFile,
        summaries: &mut SummariesFile,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record_id = meta.record_id.clone();
        let messages = self
            .history
            .record_search(&meta.channel_id, &record_id)
            .await
            .with_context(|| format!("failed to load record {record_id}"))?;
        let record_text = format_session_record(&messages);

        let llm = self.orchestrator.llm();
        match summarize_record(llm, self.orchestrator.policy(), &self.token, &record_text).await {
            Ok(summary) => {
                let updated = append_summary(
                    now,
                    std::mem::take(summaries),
                    &record_id,
                    &summary,
                    self.config.memory.max_summaries,
                );
                *summaries = updated;
                self.store.save_summaries(user_id, summaries).await?;
                meta.last_summarized_record_id = record_id.clone();
                self.store.save_metadata(user_id, meta).await?;
                info!(
                    user = user_id,
                    record = %record_id,
                    summaries = summaries.summaries.len(),
                    preview = %preview(&summary, 160),
                    "summary saved"
                );
            }
            Err(err) => {
                let err = format!("{err:#}");
                warn!(user = user_id, record = %record_id, %err, "summarize failed");
            }
        }

        self.merge_facts(user_id, &record_text, facts, now, "end-of-session").await;
        info!(user = user_id, record = %record_id, "record finalized");
        Ok(())
    }

    /// Extract facts from `text` and merge them; failures leave memory as is.
    async fn merge_facts(
        &self,
        user_id: &str,
        text: &str,
        facts: &mut FactsFile,
        now: DateTime<Utc>,
        source: &str,
    ) -> bool {
        let llm = self.orchestrator.llm();
        let policy = self.orchestrator.policy();
        let extraction = match extract_facts(llm, policy, &self.token, text, facts).await {
            Ok(extraction) => extraction,
            Err(err) => {
                warn!(user = user_id, source, err = %format!("{err:#}"), "fact extraction failed");
                return false;
            }
        };
        if extraction.facts.is_empty() && extraction.used_fact_ids.is_empty() {
            debug!(user = user_id, source, "no fact changes");
            return true;
        }

        touch_facts(&mut facts.facts, &extraction.used_fact_ids, now);
        let max = self.config.memory.max_facts;
        *facts = upsert_facts(now, std::mem::take(facts), &extraction.facts, max);
        if let Err(err) = self.store.save_facts(user_id, facts).await {
            warn!(user = user_id, source, %err, "failed to save facts");
            return false;
        }
        info!(
            user = user_id,
            source,
            count = facts.facts.len(),
            used = extraction.used_fact_ids.len(),
            new = extraction.facts.len(),
            "facts updated"
        );
        true
    }

    // ── Background work ──────────────────────────────────────────────────

    /// Run due proactive requests for one user.  Caller holds the lock.
    async fn dispatch_proactive(&self, user_id: &str, now: DateTime<Utc>) {
        let result: Result<()> = async {
            let queue: ProactiveQueue = self.store.load(user_id, Document::ProactiveQueue).await?;
            if !queue.has_due(now) {
                return Ok(());
            }
            let meta = self.store.load_metadata(user_id).await?;
            let summaries = self.store.load_summaries(user_id).await?;
            let dispatcher = ProactiveDispatcher {
                orchestrator: &self.orchestrator,
                history: self.history.as_ref(),
                outbound: &self.outbound,
                cfg: &self.config.proactive,
                directives: &self.config.directives,
                persona: &self.config.agent.persona,
                max_session_messages: self.config.session.max_session_messages,
            };
            let queue = dispatcher.run(user_id, now, queue, &meta, &summaries).await;
            self.store.save(user_id, Document::ProactiveQueue, &queue).await
        }
        .await;
        if let Err(err) = result {
            warn!(user = user_id, %err, "proactive dispatch failed");
        }
    }

    /// Finalize a session that went quiet without a rollover.
    async fn finalize_if_stale(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut meta = self.store.load_metadata(user_id).await?;
        let Some(last) = meta.last_message_at else {
            return Ok(false);
        };
        if now - last <= self.gap() || !meta.needs_finalize() {
            return Ok(false);
        }
        let mut facts = self.store.load_facts(user_id).await?;
        let mut summaries = self.store.load_summaries(user_id).await?;
        self.finalize_record(user_id, &mut meta, &mut facts, &mut summaries, now).await?;
        Ok(true)
    }

    /// Mine facts from a live session that has new messages since the last
    /// pass.
    async fn periodic_facts(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut meta = self.store.load_metadata(user_id).await?;
        if meta.record_id.is_empty() || meta.channel_id.is_empty() {
            return Ok(false);
        }
        let Some(last) = meta.last_message_at else {
            return Ok(false);
        };
        if now - last > self.gap() || !meta.has_unprocessed_facts() {
            return Ok(false);
        }

        let record = self
            .history
            .fetch_session(&meta.channel_id, user_id, self.config.session.max_session_messages)
            .await?;
        if record.record_id.trim() != meta.record_id.trim() {
            return Ok(false);
        }

        let mut facts = self.store.load_facts(user_id).await?;
        let text = format_session_record(&record.messages);
        if !self.merge_facts(user_id, &text, &mut facts, now, "periodic").await {
            return Ok(false);
        }
        meta.last_fact_record_id = meta.record_id.clone();
        meta.last_fact_processed_at = meta.last_message_at;
        self.store.save_metadata(user_id, &meta).await?;
        Ok(true)
    }

    /// One background pass over every user with stored state.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let users = self.store.known_users().await?;
        let mut report = MaintenanceReport { users: users.len(), ..MaintenanceReport::default() };

        for user_id in &users {
            if self.token.is_cancelled() {
                info!("maintenance interrupted by shutdown");
                break;
            }
            let _guard = self.locks.acquire(user_id).await;

            self.dispatch_proactive(user_id, now).await;
            match self.finalize_if_stale(user_id, now).await {
                Ok(true) => report.finalized += 1,
                Ok(false) => {}
                Err(err) => {
                    let err = format!("{err:#}");
                    warn!(user = %user_id, %err, "stale session finalize failed");
                }
            }
            match self.periodic_facts(user_id, now).await {
                Ok(true) => report.fact_passes += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(user = %user_id, err = %format!("{err:#}"), "periodic fact pass failed");
                }
            }
        }
        info!(
            users = report.users,
            finalized = report.finalized,
            fact_passes = report.fact_passes,
            "maintenance done"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use confidant_llm::LlmError;
    use confidant_memory::{Fact, Mood, Summary};
    use tempfile::TempDir;

    use crate::outbound::tests::RecordingTransport;
    use crate::testing::{MemoryHistory, ScriptedLlm, message, text};
    use crate::transport::SessionRecord;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 20, 0, 0).unwrap()
    }

    struct Harness {
        _tmp: TempDir,
        llm: Arc<ScriptedLlm>,
        transport: Arc<RecordingTransport>,
        history: Arc<MemoryHistory>,
        controller: TurnController,
    }

    fn harness(replies: Vec<Result<confidant_llm::ChatResponse, LlmError>>) -> Harness {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.memory.state_dir = tmp.path().display().to_string();
        config.llm.max_retries = 1;
        config.reply.line_delay_base_ms = 0;
        config.reply.line_delay_per_char_ms = 0;
        config.agent.timezone = "UTC".into();

        let llm = Arc::new(ScriptedLlm::new(replies));
        let transport = Arc::new(RecordingTransport::default());
        let history = Arc::new(MemoryHistory::default());
        let collab = Collaborators {
            llm: llm.clone(),
            history: history.clone(),
            poster: transport.clone(),
            emitter: Some(transport.clone()),
            stickers: None,
            web: None,
        };
        let controller = TurnController::new(config, "bot", collab, CancellationToken::new());
        Harness { _tmp: tmp, llm, transport, history, controller }
    }

    impl Harness {
        fn live(&self, record_id: &str, start: DateTime<Utc>, contents: &[&str]) {
            let messages = contents
                .iter()
                .enumerate()
                .map(|(i, c)| message(&format!("m{i}"), "u1", c, start))
                .collect();
            *self.history.live.lock().unwrap() = SessionRecord {
                record_id: record_id.into(),
                start_at: Some(start),
                messages,
            };
        }

        fn inbound(&self, content: &str, at: DateTime<Utc>) -> InboundMessage {
            InboundMessage {
                user_id: "u1".into(),
                channel_id: "c1".into(),
                message_id: "m".into(),
                content: content.into(),
                sent_at: Some(at),
            }
        }

        async fn meta(&self) -> SessionMetadata {
            self.controller.store().load_metadata("u1").await.unwrap()
        }

        async fn queue(&self) -> ProactiveQueue {
            self.controller.store().load("u1", Document::ProactiveQueue).await.unwrap()
        }
    }

    #[tokio::test]
    async fn first_message_opens_session_with_defaults() {
        let h = harness(vec![Ok(text("hi there"))]);
        h.live("r1", t0(), &["hello"]);

        let out = h.controller.handle_message(&h.inbound("hello", t0())).await.unwrap();
        assert!(out.new_session);
        assert_eq!(out.record_id, "r1");

        let meta = h.meta().await;
        assert_eq!(meta.record_id, "r1");
        assert_eq!(meta.channel_id, "c1");
        assert_eq!(meta.user_activity_frequency, "Active recently");
        assert_eq!(meta.time_since_last_message, "unknown");
        assert_eq!(meta.session_start_datetime, "2026-06-01 20:00");
        assert_eq!(meta.last_message_at, Some(t0()));
        assert_eq!(h.transport.contents(), vec!["hi there"]);
        // Nothing to finalize on a first contact.
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn activity_is_refreshed_only_when_the_record_changes() {
        let h = harness(vec![Ok(text("hi")), Ok(text("sure")), Ok(text("new topic"))]);
        *h.history.activity.lock().unwrap() = Some("Active 2 days in the last 7".into());
        h.live("r1", t0(), &["hello"]);
        h.controller.handle_message(&h.inbound("hello", t0())).await.unwrap();
        assert_eq!(h.meta().await.user_activity_frequency, "Active 2 days in the last 7");

        *h.history.activity.lock().unwrap() = Some("Active 5 days in the last 7".into());
        let later = t0() + TimeDelta::minutes(5);
        h.live("r1", t0(), &["hello", "still here"]);
        h.controller.handle_message(&h.inbound("still here", later)).await.unwrap();
        assert_eq!(h.meta().await.user_activity_frequency, "Active 2 days in the last 7");

        let next = t0() + TimeDelta::minutes(10);
        h.live("r2", next, &["another thing"]);
        let out = h.controller.handle_message(&h.inbound("another thing", next)).await.unwrap();
        assert!(!out.new_session);
        let meta = h.meta().await;
        assert_eq!(meta.record_id, "r2");
        assert_eq!(meta.user_activity_frequency, "Active 5 days in the last 7");
        assert_eq!(h.llm.calls(), 3);
    }

    #[tokio::test]
    async fn prompt_carries_layers_and_history() {
        let h = harness(vec![Ok(text("ok"))]);
        h.live("r1", t0(), &["how are you"]);
        h.controller.handle_message(&h.inbound("how are you", t0())).await.unwrap();

        let request = h.llm.last_request();
        assert_eq!(request[0].content, crate::prompt::DEFAULT_PERSONA);
        assert!(request[1].content.contains("### L2 Session Metadata"));
        let mood_line = "initial_mood: {\"valence\": 0.2000, \"arousal\": 0.1000}";
        assert!(request[1].content.contains(mood_line));
        assert!(request[2].content.ends_with("how are you"));
    }

    #[tokio::test]
    async fn silence_sends_nothing() {
        let h = harness(vec![Ok(text("<SILENCE>"))]);
        h.live("r1", t0(), &["ok bye"]);
        h.controller.handle_message(&h.inbound("ok bye", t0())).await.unwrap();
        assert_eq!(h.transport.sends(), 0);
    }

    #[tokio::test]
    async fn want_more_triggers_one_continuation() {
        let h = harness(vec![Ok(text("hello\n<WANT_MORE>")), Ok(text("also this\n<WANT_MORE>"))]);
        h.live("r1", t0(), &["hey"]);
        let out = h.controller.handle_message(&h.inbound("hey", t0())).await.unwrap();

        assert_eq!(out.reply, "hello");
        assert!(out.continued);
        assert_eq!(h.llm.calls(), 2);
        assert_eq!(h.transport.contents(), vec!["hello", "also this"]);

        let second = h.llm.last_request();
        let n = second.len();
        assert_eq!(second[n - 2], ChatMessage::assistant("hello"));
        assert_eq!(second[n - 1], ChatMessage::user(CONTINUE_NUDGE));
    }

    #[tokio::test]
    async fn proactive_directive_is_queued_with_clamped_delay() {
        let h = harness(vec![Ok(text(
            "good night\n<PROACTIVE>{\"delay_seconds\":10,\"reason\":\"check in\"}",
        ))]);
        h.live("r1", t0(), &["night"]);
        let out = h.controller.handle_message(&h.inbound("night", t0())).await.unwrap();
        assert_eq!(out.proactive_queued, 1);
        assert_eq!(h.transport.contents(), vec!["good night"]);

        let queue = h.queue().await;
        assert_eq!(queue.requests.len(), 1);
        let req = &queue.requests[0];
        assert_eq!(req.request_at, Some(t0() + TimeDelta::seconds(30)));
        assert_eq!(req.reason, "check in");
        assert_eq!(req.record_id, "r1");
        assert!(!req.id.is_empty());
    }

    #[tokio::test]
    async fn final_mood_is_stored_and_stripped() {
        let h = harness(vec![Ok(text("yay\nfinal_mood: {\"valence\": 0.8, \"arousal\": 0.6}"))]);
        h.live("r1", t0(), &["I passed!"]);
        h.controller.handle_message(&h.inbound("I passed!", t0())).await.unwrap();
        assert_eq!(h.meta().await.final_mood, Some(Mood::new(0.8, 0.6)));
        assert_eq!(h.transport.contents(), vec!["yay"]);
    }

    async fn seed_previous_session(h: &Harness) {
        let meta = SessionMetadata {
            record_id: "r0".into(),
            channel_id: "c1".into(),
            last_message_at: Some(t0() - TimeDelta::hours(2)),
            ..SessionMetadata::default()
        };
        h.controller.store().save_metadata("u1", &meta).await.unwrap();
        h.history
            .records
            .lock()
            .unwrap()
            .insert(
                "r0".into(),
                vec![message("a", "u1", "my cat is called Miso", t0() - TimeDelta::hours(2))],
            );
    }

    #[tokio::test]
    async fn rollover_finalizes_previous_record_once() {
        let h = harness(vec![
            Ok(text("Talked about the cat Miso.")),
            Ok(text(r#"{"facts":["has a cat named Miso"],"used_fact_ids":[]}"#)),
            Ok(text("welcome back")),
            Ok(text("sure")),
        ]);
        seed_previous_session(&h).await;
        h.live("r1", t0(), &["hi again"]);

        let out = h.controller.handle_message(&h.inbound("hi again", t0())).await.unwrap();
        assert!(out.new_session);

        let meta = h.meta().await;
        assert_eq!(meta.last_summarized_record_id, "r0");
        assert_eq!(meta.record_id, "r1");
        assert_eq!(meta.time_since_last_message, "~2h 0m");

        let summaries = h.controller.store().load_summaries("u1").await.unwrap();
        assert_eq!(summaries.summaries.len(), 1);
        assert_eq!(summaries.summaries[0].record_id, "r0");
        let facts = h.controller.store().load_facts("u1").await.unwrap();
        assert_eq!(facts.facts[0].content, "has a cat named Miso");

        // Same session: no further finalize, one model call for the reply.
        h.controller
            .handle_message(&h.inbound("and another thing", t0() + TimeDelta::minutes(5)))
            .await
            .unwrap();
        assert_eq!(h.llm.calls(), 4);
        assert_eq!(h.controller.store().load_summaries("u1").await.unwrap().summaries.len(), 1);
    }

    #[tokio::test]
    async fn failed_finalize_does_not_block_reply_or_advance_marker() {
        let h = harness(vec![
            Err(LlmError::Permanent("status=400".into())),
            Err(LlmError::Permanent("status=400".into())),
            Ok(text("welcome back")),
        ]);
        seed_previous_session(&h).await;
        h.live("r1", t0(), &["hi again"]);

        h.controller.handle_message(&h.inbound("hi again", t0())).await.unwrap();
        assert_eq!(h.transport.contents(), vec!["welcome back"]);
        let meta = h.meta().await;
        assert_eq!(meta.last_summarized_record_id, "");
        assert_eq!(meta.record_id, "r1");
    }

    #[tokio::test]
    async fn reply_failure_sends_nothing_but_keeps_metadata() {
        let h = harness(vec![Err(LlmError::Permanent("status=401".into()))]);
        h.live("r1", t0(), &["hello"]);
        assert!(h.controller.handle_message(&h.inbound("hello", t0())).await.is_err());
        assert_eq!(h.transport.sends(), 0);
        assert_eq!(h.meta().await.record_id, "r1");
    }

    #[tokio::test]
    async fn remember_request_extracts_facts() {
        let h = harness(vec![
            Ok(text("noted!")),
            Ok(text(r#"{"facts":["likes jasmine tea"],"used_fact_ids":[]}"#)),
        ]);
        h.live("r1", t0(), &["Please REMEMBER that I like jasmine tea"]);
        h.controller
            .handle_message(&h.inbound("Please REMEMBER that I like jasmine tea", t0()))
            .await
            .unwrap();
        let facts = h.controller.store().load_facts("u1").await.unwrap();
        assert_eq!(facts.facts.len(), 1);
        assert_eq!(facts.facts[0].content, "likes jasmine tea");
    }

    #[test]
    fn remember_detection() {
        assert!(wants_remember("remember this"));
        assert!(wants_remember("请记住我的生日"));
        assert!(!wants_remember("   "));
        assert!(!wants_remember("hello"));
    }

    #[tokio::test]
    async fn maintenance_finalizes_stale_sessions_and_dispatches_proactive() {
        let h = harness(vec![
            Ok(text("Chatted about Miso.")),
            Ok(text(r#"{"facts":[],"used_fact_ids":[]}"#)),
        ]);
        seed_previous_session(&h).await;
        let queue = ProactiveQueue {
            requests: vec![crate::proactive::ProactiveRequest {
                id: "p1".into(),
                added_at: Some(t0() - TimeDelta::hours(2)),
                request_at: Some(t0() - TimeDelta::hours(1)),
                attempts: 3,
                channel_id: "c1".into(),
                record_id: "r0".into(),
                ..Default::default()
            }],
        };
        h.controller.store().save("u1", Document::ProactiveQueue, &queue).await.unwrap();

        let report = h.controller.run_maintenance(t0()).await.unwrap();
        assert_eq!(report.users, 1);
        assert_eq!(report.finalized, 1);
        assert!(h.queue().await.requests.is_empty());
        assert_eq!(h.meta().await.last_summarized_record_id, "r0");
        assert_eq!(h.transport.sends(), 0);
    }

    #[tokio::test]
    async fn maintenance_runs_periodic_fact_pass_for_live_session() {
        let h = harness(vec![Ok(text(r#"{"facts":[],"used_fact_ids":["F00aa"]}"#))]);
        let meta = SessionMetadata {
            record_id: "r1".into(),
            channel_id: "c1".into(),
            last_message_at: Some(t0() - TimeDelta::minutes(5)),
            ..SessionMetadata::default()
        };
        h.controller.store().save_metadata("u1", &meta).await.unwrap();
        let facts = FactsFile {
            facts: vec![Fact {
                id: "F00aa".into(),
                content: "likes tea".into(),
                created_at: t0() - TimeDelta::days(3),
                last_accessed_at: None,
            }],
        };
        h.controller.store().save_facts("u1", &facts).await.unwrap();
        h.live("r1", t0() - TimeDelta::minutes(10), &["tea time"]);

        let report = h.controller.run_maintenance(t0()).await.unwrap();
        assert_eq!(report.fact_passes, 1);
        let meta = h.meta().await;
        assert_eq!(meta.last_fact_record_id, "r1");
        assert_eq!(meta.last_fact_processed_at, Some(t0() - TimeDelta::minutes(5)));
        let facts = h.controller.store().load_facts("u1").await.unwrap();
        assert_eq!(facts.facts[0].last_accessed_at, Some(t0()));

        // Nothing new since: the next pass is a no-op.
        let report = h.controller.run_maintenance(t0()).await.unwrap();
        assert_eq!(report.fact_passes, 0);
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn summaries_from_state_reach_the_prompt() {
        let h = harness(vec![Ok(text("hey"))]);
        let summaries = SummariesFile {
            summaries: vec![Summary {
                id: "S01".into(),
                record_id: "r0".into(),
                summary: "Talked about exams.".into(),
                created_at: None,
            }],
        };
        h.controller.store().save_summaries("u1", &summaries).await.unwrap();
        h.live("r1", t0(), &["hi"]);
        h.controller.handle_message(&h.inbound("hi", t0())).await.unwrap();
        assert!(h.llm.last_request()[1].content.contains("S01: Talked about exams. (RecordID=r0)"));
    }
}

//! Paced, line-by-line delivery of replies and stickers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use confidant_config::{DirectiveConfig, ReplyConfig};
use confidant_llm::{preview, sleep_cancellable};

use crate::directives::{StickerDirective, is_silence};
use crate::transport::{
    MESSAGE_CREATE_EVENT, MessagePoster, RealtimeEmitter, StickerResolver, sticker_payload,
    text_payload,
};

/// Typing simulation between consecutive lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub base: Duration,
    pub per_char: Duration,
    pub max: Duration,
}

impl Pacing {
    pub fn from_config(cfg: &ReplyConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.line_delay_base_ms),
            per_char: Duration::from_millis(cfg.line_delay_per_char_ms),
            max: Duration::from_millis(cfg.line_delay_max_ms),
        }
    }

    /// `base + chars * per_char`, capped at `max`; zero for a blank line.
    pub fn delay_for_line(&self, line: &str) -> Duration {
        let chars = line.trim().chars().count() as u32;
        if chars == 0 {
            return Duration::ZERO;
        }
        self.base.saturating_add(self.per_char.saturating_mul(chars)).min(self.max)
    }
}

/// Trimmed non-blank lines of `text`, at most `max_lines` of them.
pub fn split_lines(text: &str, max_lines: usize) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(max_lines)
        .collect()
}

/// Sends replies through the realtime emitter with a REST fallback.
pub struct Outbound {
    emitter: Option<Arc<dyn RealtimeEmitter>>,
    poster: Arc<dyn MessagePoster>,
    stickers: Option<Arc<dyn StickerResolver>>,
    pacing: Pacing,
    max_lines: usize,
    silence_token: String,
    token: CancellationToken,
}

impl Outbound {
    pub fn new(
        poster: Arc<dyn MessagePoster>,
        reply: &ReplyConfig,
        directives: &DirectiveConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            emitter: None,
            poster,
            stickers: None,
            pacing: Pacing::from_config(reply),
            max_lines: reply.max_lines.max(1),
            silence_token: directives.silence_token.clone(),
            token,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn RealtimeEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_stickers(mut self, stickers: Arc<dyn StickerResolver>) -> Self {
        self.stickers = Some(stickers);
        self
    }

    pub fn stickers(&self) -> Option<&Arc<dyn StickerResolver>> {
        self.stickers.as_ref()
    }

    /// Emit one text message, falling back to REST.  When both fail the
    /// error names both causes.
    async fn send_text(&self, channel_id: &str, content: &str) -> Result<()> {
        let Some(emitter) = &self.emitter else {
            return self.poster.post_message(channel_id, content).await;
        };
        let payload = text_payload(channel_id, content);
        let Err(gateway_err) = emitter.emit(MESSAGE_CREATE_EVENT, payload).await else {
            return Ok(());
        };
        match self.poster.post_message(channel_id, content).await {
            Ok(()) => {
                warn!(
                    channel = channel_id,
                    err = %gateway_err,
                    "realtime send failed, REST fallback ok"
                );
                Ok(())
            }
            Err(http_err) => Err(anyhow!(
                "send message failed (gateway={gateway_err:#} http={http_err:#})"
            )),
        }
    }

    async fn send_sticker_id(&self, channel_id: &str, sticker_id: &str) -> Result<()> {
        let Some(emitter) = &self.emitter else {
            return self.poster.post_sticker(channel_id, sticker_id).await;
        };
        let payload = sticker_payload(channel_id, sticker_id);
        let Err(gateway_err) = emitter.emit(MESSAGE_CREATE_EVENT, payload).await else {
            return Ok(());
        };
        match self.poster.post_sticker(channel_id, sticker_id).await {
            Ok(()) => {
                warn!(
                    channel = channel_id,
                    err = %gateway_err,
                    "realtime sticker failed, REST fallback ok"
                );
                Ok(())
            }
            Err(http_err) => Err(anyhow!(
                "send sticker failed (gateway={gateway_err:#} http={http_err:#})"
            )),
        }
    }

    /// Send `lines` one by one, pausing between them.  Once shutdown is
    /// requested the pauses are skipped but every line is still sent.
    async fn send_lines<'a, F, Fut>(&self, lines: &[&'a str], mut send: F) -> Result<usize>
    where
        F: FnMut(&'a str) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut paced = true;
        for (i, line) in lines.iter().enumerate() {
            send(*line).await?;
            if !paced || i + 1 == lines.len() {
                continue;
            }
            if !sleep_cancellable(&self.token, self.pacing.delay_for_line(line)).await {
                warn!(
                    sent = i + 1,
                    total = lines.len(),
                    "pacing interrupted by shutdown, flushing remaining lines"
                );
                paced = false;
            }
        }
        Ok(lines.len())
    }

    /// Deliver a reply and its optional sticker.
    ///
    /// Nothing is sent for an empty reply without a sticker, or when the
    /// text carries the silence token.  An unknown sticker name is logged
    /// and skipped; resolver errors propagate.
    pub async fn send_reply(
        &self,
        channel_id: &str,
        reply: &str,
        sticker: Option<&StickerDirective>,
    ) -> Result<()> {
        let reply = reply.trim();
        let sticker_name = sticker.map(|s| s.name.trim()).unwrap_or_default();

        if reply.is_empty() && sticker_name.is_empty() {
            info!(channel = channel_id, "empty reply, nothing to send");
            return Ok(());
        }
        if is_silence(reply, &self.silence_token) {
            info!(channel = channel_id, "model chose silence");
            return Ok(());
        }

        if !reply.is_empty() {
            info!(channel = channel_id, preview = %preview(reply, 160), "reply ready");
            let lines = split_lines(reply, self.max_lines);
            let sent = self
                .send_lines(&lines, |line| self.send_text(channel_id, line))
                .await?;
            info!(channel = channel_id, lines = sent, "reply sent");
        }

        if !sticker_name.is_empty() {
            self.send_sticker(channel_id, sticker_name).await?;
        }
        Ok(())
    }

    async fn send_sticker(&self, channel_id: &str, name: &str) -> Result<()> {
        let Some(resolver) = &self.stickers else {
            warn!(channel = channel_id, name, "no sticker resolver configured, skipping sticker");
            return Ok(());
        };
        let resolved = resolver.resolve(name).await?;
        let Some(sticker_id) = resolved.filter(|id| !id.trim().is_empty()) else {
            info!(channel = channel_id, name, "sticker not found");
            return Ok(());
        };
        self.send_sticker_id(channel_id, sticker_id.trim()).await?;
        info!(channel = channel_id, name, "sticker sent");
        Ok(())
    }

    /// Interim assistant text shown while tools run.
    pub async fn send_prelude(&self, channel_id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.send_text(channel_id, text).await
    }

    /// REST-only paced delivery for asynchronous (proactive) sends.
    pub async fn send_reply_rest(&self, channel_id: &str, reply: &str) -> Result<usize> {
        let lines = split_lines(reply, self.max_lines);
        if lines.is_empty() {
            return Ok(0);
        }
        self.send_lines(&lines, |line| self.poster.post_message(channel_id, line))
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    /// Records every delivery; can be told to fail.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub emitted: Mutex<Vec<Value>>,
        pub posted: Mutex<Vec<(String, String)>>,
        pub fail_emit: bool,
        pub fail_post: bool,
    }

    impl RecordingTransport {
        pub fn sends(&self) -> usize {
            self.emitted.lock().unwrap().len() + self.posted.lock().unwrap().len()
        }

        pub fn contents(&self) -> Vec<String> {
            let mut out: Vec<String> = self
                .emitted
                .lock()
                .unwrap()
                .iter()
                .filter_map(|v| v["content"].as_str().map(str::to_string))
                .collect();
            out.extend(self.posted.lock().unwrap().iter().map(|(_, c)| c.clone()));
            out
        }
    }

    #[async_trait]
    impl RealtimeEmitter for RecordingTransport {
        async fn emit(&self, _event: &str, payload: Value) -> Result<()> {
            if self.fail_emit {
                return Err(anyhow!("socket closed"));
            }
            self.emitted.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[async_trait]
    impl MessagePoster for RecordingTransport {
        async fn post_message(&self, channel_id: &str, content: &str) -> Result<()> {
            if self.fail_post {
                return Err(anyhow!("status=503 body=busy"));
            }
            self.posted.lock().unwrap().push((channel_id.to_string(), content.to_string()));
            Ok(())
        }

        async fn post_sticker(&self, channel_id: &str, sticker_id: &str) -> Result<()> {
            if self.fail_post {
                return Err(anyhow!("status=503 body=busy"));
            }
            let entry = (channel_id.to_string(), format!("sticker:{sticker_id}"));
            self.posted.lock().unwrap().push(entry);
            Ok(())
        }
    }

    struct Stickers;

    #[async_trait]
    impl StickerResolver for Stickers {
        async fn resolve(&self, name: &str) -> Result<Option<String>> {
            match name {
                "Wave" => Ok(Some("stk-wave".to_string())),
                "Broken" => Err(anyhow!("sticker service down")),
                _ => Ok(None),
            }
        }
    }

    fn outbound(transport: Arc<RecordingTransport>) -> Outbound {
        Outbound::new(
            transport.clone(),
            &ReplyConfig::default(),
            &DirectiveConfig::default(),
            CancellationToken::new(),
        )
        .with_emitter(transport)
        .with_stickers(Arc::new(Stickers))
    }

    #[test]
    fn line_delay_scales_and_caps() {
        let pacing = Pacing::from_config(&ReplyConfig::default());
        assert_eq!(pacing.delay_for_line("   "), Duration::ZERO);
        assert_eq!(pacing.delay_for_line("abcde"), Duration::from_millis(350 + 5 * 60));
        assert_eq!(pacing.delay_for_line("你好"), Duration::from_millis(350 + 2 * 60));
        assert_eq!(pacing.delay_for_line(&"x".repeat(500)), Duration::from_millis(3500));
    }

    #[test]
    fn split_skips_blanks_and_caps() {
        assert_eq!(split_lines(" a \n\n b\r\n c ", 2), vec!["a", "b"]);
        assert!(split_lines("\n  \n", 5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn multi_line_reply_is_emitted_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        outbound(transport.clone())
            .send_reply("c1", "one\n\ntwo\nthree", None)
            .await
            .unwrap();
        assert_eq!(transport.contents(), vec!["one", "two", "three"]);
        assert!(transport.posted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_waits_between_lines_only() {
        let transport = Arc::new(RecordingTransport::default());
        let out = outbound(transport.clone());
        let start = tokio::time::Instant::now();
        out.send_reply("c1", "ab\ncd", None).await.unwrap();
        // One gap, after "ab": 350 + 2 * 60.
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(470) && elapsed < Duration::from_millis(480),
            "{elapsed:?}"
        );
    }

    #[tokio::test]
    async fn silence_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let sticker = StickerDirective { name: "Wave".into() };
        outbound(transport.clone())
            .send_reply("c1", "<SILENCE>", Some(&sticker))
            .await
            .unwrap();
        assert_eq!(transport.sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_failure_falls_back_to_rest() {
        let transport = Arc::new(RecordingTransport { fail_emit: true, ..Default::default() });
        outbound(transport.clone()).send_reply("c1", "hi\nthere", None).await.unwrap();
        assert_eq!(transport.posted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn both_paths_failing_reports_both_errors() {
        let transport = Arc::new(RecordingTransport {
            fail_emit: true,
            fail_post: true,
            ..Default::default()
        });
        let err = outbound(transport).send_reply("c1", "hi", None).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("gateway=socket closed"), "{msg}");
        assert!(msg.contains("http=status=503"), "{msg}");
    }

    #[tokio::test]
    async fn sticker_only_reply_is_delivered() {
        let transport = Arc::new(RecordingTransport::default());
        let sticker = StickerDirective { name: "Wave".into() };
        outbound(transport.clone()).send_reply("c1", "", Some(&sticker)).await.unwrap();
        let emitted = transport.emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0]["payload"]["stickerId"], "stk-wave");
    }

    #[tokio::test]
    async fn unknown_sticker_is_skipped_and_resolver_errors_propagate() {
        let transport = Arc::new(RecordingTransport::default());
        let out = outbound(transport.clone());
        out.send_reply("c1", "", Some(&StickerDirective { name: "Nope".into() }))
            .await
            .unwrap();
        assert_eq!(transport.sends(), 0);

        let err = out
            .send_reply("c1", "", Some(&StickerDirective { name: "Broken".into() }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sticker service down"));
    }

    #[tokio::test(start_paused = true)]
    async fn rest_only_send_never_emits() {
        let transport = Arc::new(RecordingTransport::default());
        let sent = outbound(transport.clone()).send_reply_rest("c1", "a\nb").await.unwrap();
        assert_eq!(sent, 2);
        assert!(transport.emitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_skips_pauses_but_sends_every_line() {
        let transport = Arc::new(RecordingTransport::default());
        let token = CancellationToken::new();
        let reply = ReplyConfig { line_delay_base_ms: 60_000, ..ReplyConfig::default() };
        let directives = DirectiveConfig::default();
        let out = Outbound::new(transport.clone(), &reply, &directives, token.clone());
        token.cancel();

        let send = out.send_reply_rest("c1", "a\nb\nc");
        let sent = tokio::time::timeout(Duration::from_secs(5), send)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent, 3);
        assert_eq!(transport.contents(), vec!["a", "b", "c"]);
    }
}

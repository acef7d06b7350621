//! Trailing control lines embedded in model output.
//!
//! Only the contiguous run of directive lines at the very end of a reply
//! is recognized.  The scan walks backward over non-blank lines, classifies
//! each one, and stops at the first line that is ordinary text.

use serde::{Deserialize, Serialize};

use confidant_config::DirectiveConfig;

/// `{"delay_seconds":int,"delay_minutes":int,"reason":string}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveDirective {
    pub delay_seconds: i64,
    pub delay_minutes: i64,
    pub reason: String,
}

/// `{"name":string}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StickerDirective {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyDirectives {
    pub want_more: bool,
    pub proactive: Option<ProactiveDirective>,
    pub sticker: Option<StickerDirective>,
}

impl ReplyDirectives {
    pub fn is_empty(&self) -> bool {
        !self.want_more && self.proactive.is_none() && self.sticker.is_none()
    }
}

/// Classification of one trailing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingLine<'a> {
    WantMore,
    Proactive(&'a str),
    Sticker(&'a str),
    Stop,
}

/// Classify a single trimmed line against the configured tokens.
pub fn classify_line<'a>(line: &'a str, tokens: &DirectiveConfig) -> TrailingLine<'a> {
    let t = line.trim();
    if !tokens.want_more_token.is_empty() && t == tokens.want_more_token {
        return TrailingLine::WantMore;
    }
    if let Some(raw) = strip_token(t, &tokens.proactive_prefix) {
        return TrailingLine::Proactive(raw);
    }
    if let Some(raw) = strip_token(t, &tokens.sticker_prefix) {
        return TrailingLine::Sticker(raw);
    }
    TrailingLine::Stop
}

fn strip_token<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    line.strip_prefix(prefix).map(str::trim)
}

fn parse_proactive(raw: &str) -> Option<ProactiveDirective> {
    if raw.is_empty() {
        return None;
    }
    let mut d: ProactiveDirective = serde_json::from_str(raw).ok()?;
    d.delay_seconds = d.delay_seconds.max(0);
    d.delay_minutes = d.delay_minutes.max(0);
    d.reason = d.reason.trim().to_string();
    Some(d)
}

fn parse_sticker(raw: &str) -> Option<StickerDirective> {
    if raw.is_empty() {
        return None;
    }
    let name = match serde_json::from_str::<StickerDirective>(raw) {
        Ok(d) => d.name.trim().to_string(),
        // Not JSON: the remainder is a bare, possibly quoted, name.
        Err(_) => raw.trim().trim_matches('"').to_string(),
    };
    (!name.is_empty()).then_some(StickerDirective { name })
}

/// Split a raw reply into clean display text and its trailing directives.
///
/// Each recognized directive line is removed.  For proactive and sticker
/// directives the first one encountered (scanning from the end) wins; any
/// further lines of the same kind are stripped without being parsed.
pub fn parse_reply(reply: &str, tokens: &DirectiveConfig) -> (String, ReplyDirectives) {
    let normalized = reply.replace("\r\n", "\n");
    let mut lines: Vec<&str> = normalized.split('\n').collect();
    let mut out = ReplyDirectives::default();

    while let Some(last) = lines.iter().rposition(|l| !l.trim().is_empty()) {
        match classify_line(lines[last], tokens) {
            TrailingLine::WantMore => out.want_more = true,
            TrailingLine::Proactive(raw) => {
                if out.proactive.is_none() {
                    out.proactive = parse_proactive(raw);
                }
            }
            TrailingLine::Sticker(raw) => {
                if out.sticker.is_none() {
                    out.sticker = parse_sticker(raw);
                }
            }
            TrailingLine::Stop => break,
        }
        lines.remove(last);
    }

    (lines.join("\n").trim().to_string(), out)
}

/// True when the clean text asks for nothing to be sent.
pub fn is_silence(clean: &str, silence_token: &str) -> bool {
    let token = silence_token.trim();
    if token.is_empty() {
        return false;
    }
    let clean = clean.trim();
    clean == token || clean.contains(token)
}

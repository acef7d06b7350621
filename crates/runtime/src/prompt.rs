//! Prompt assembly.
//!
//! A turn is sent as: persona (system), the layered context block (user:
//! instructions, L2 session metadata, L3 facts, L4 summaries), then the
//! live session history (L5) as alternating user/assistant messages.

use chrono::{DateTime, SecondsFormat, Utc};

use confidant_config::DirectiveConfig;
use confidant_llm::ChatMessage;
use confidant_memory::{
    FactsFile, SessionMetadata, SummariesFile, format_facts_for_context,
    format_summaries_for_context,
};

use crate::session::Zone;
use crate::transport::ChannelMessage;

pub const DEFAULT_PERSONA: &str = "You are a helpful assistant.";

/// Persona text, or a neutral default when none is configured.
pub fn persona_or_default(persona: &str) -> &str {
    match persona.trim() {
        "" => DEFAULT_PERSONA,
        p => p,
    }
}

/// Output conventions the model must follow, with the configured tokens
/// substituted in.
pub fn developer_instructions(tokens: &DirectiveConfig, sticker_names: &[String]) -> String {
    let stickers = if sticker_names.is_empty() {
        "(none)".to_string()
    } else {
        sticker_names.join(", ")
    };
    format!(
        "### L1 Output Rules\n\
         - Reply as yourself in plain chat text. \
         Each line you write is delivered as a separate message.\n\
         - If nothing is worth saying, output exactly {silence} and nothing else.\n\
         - Optional control lines may follow your reply, each on its own line at the very end:\n\
         \x20 - {want_more} : you want to keep talking after this message.\n\
         \x20 - {proactive}{{\"delay_seconds\":180,\"reason\":\"...\"}} : \
         schedule one follow-up later (delay_minutes is also accepted).\n\
         \x20 - {sticker}{{\"name\":\"...\"}} : also send a sticker. \
         Available stickers: {stickers}\n\
         - You may end with a line `final_mood: {{\"valence\": v, \"arousal\": a}}` \
         describing your mood after this turn; it is never shown to the user.\n\
         - Use the tools to look up past conversations or the web \
         when the context below is not enough.",
        silence = tokens.silence_token,
        want_more = tokens.want_more_token,
        proactive = tokens.proactive_prefix,
        sticker = tokens.sticker_prefix,
    )
}

/// Layers L1 to L4 as a single user message.
pub fn build_context_prompt(
    instructions: &str,
    meta: &SessionMetadata,
    facts: &FactsFile,
    summaries: &SummariesFile,
) -> String {
    let mut out = String::new();
    out.push_str(instructions.trim());
    out.push_str("\n\n");

    out.push_str("### L2 Session Metadata\n");
    out.push_str(&format!("session_start_datetime: {}\n", meta.session_start_datetime.trim()));
    out.push_str(&format!("time_since_last_message: {}\n", meta.time_since_last_message.trim()));
    out.push_str(&format!("user_activity_frequency: {}\n", meta.user_activity_frequency.trim()));
    out.push_str(&format!(
        "initial_mood: {{\"valence\": {:.4}, \"arousal\": {:.4}}}\n\n",
        meta.initial_mood.valence, meta.initial_mood.arousal
    ));

    out.push_str("### L3 User Memory (Facts)\n");
    out.push_str(&format_facts_for_context(facts));
    out.push_str("\n\n");

    out.push_str("### L4 Recent Summaries\n");
    out.push_str(&format_summaries_for_context(summaries));

    out.trim().to_string()
}

/// Strip characters that would break the speaker tag and cap its length.
fn sanitize_meta_value(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '\r' | '\n' | '\t' => ' ',
            '"' => '\'',
            '<' => '(',
            '>' => ')',
            c => c,
        })
        .take(80)
        .collect();
    cleaned.trim().to_string()
}

/// `<speaker username="..." user_id="..." time="HH:MM"/>`
pub fn speaker_meta_line(
    username: &str,
    user_id: &str,
    sent_at: Option<DateTime<Utc>>,
    zone: &Zone,
) -> String {
    let or_unknown = |s: String| if s.is_empty() { "unknown".to_string() } else { s };
    let name = or_unknown(sanitize_meta_value(username));
    let id = or_unknown(sanitize_meta_value(user_id));
    match sent_at {
        Some(at) => format!(
            "<speaker username=\"{name}\" user_id=\"{id}\" time=\"{}\"/>",
            zone.format(at, "%H:%M")
        ),
        None => format!("<speaker username=\"{name}\" user_id=\"{id}\"/>"),
    }
}

/// Layer L5: the live session as chat messages.  Messages authored by
/// `bot_user_id` become assistant turns; user turns carry a speaker tag.
pub fn build_history_messages(
    messages: &[ChannelMessage],
    bot_user_id: &str,
    zone: &Zone,
) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| {
            let content = m.content.trim();
            if m.author_id.trim() == bot_user_id.trim() {
                ChatMessage::assistant(content)
            } else {
                let meta = speaker_meta_line(&m.author_name, &m.author_id, m.created_at, zone);
                ChatMessage::user(format!("{meta}\n{content}"))
            }
        })
        .collect()
}

/// One line per message: `[id] 2026-01-01T10:00:00Z author: text`.
pub fn format_session_record(messages: &[ChannelMessage]) -> String {
    if messages.is_empty() {
        return "(empty)".to_string();
    }
    messages
        .iter()
        .map(|m| {
            let ts = m
                .created_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            format!("[{}] {} {}: {}", m.id.trim(), ts, m.author(), m.content.trim())
                .trim()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Proactive composition ────────────────────────────────────────────────────

/// Everything the model sees when deciding on a scheduled follow-up.
#[derive(Debug, Clone)]
pub struct ProactivePromptContext<'a> {
    pub now: DateTime<Utc>,
    pub added_at: DateTime<Utc>,
    pub request_at: DateTime<Utc>,
    pub reason: &'a str,
    pub record_id: &'a str,
    pub current_channel_id: &'a str,
    pub current_record_id: &'a str,
    pub scheduled_record_text: &'a str,
    pub intermediate_summaries: &'a str,
    pub current_record_text: &'a str,
}

pub fn proactive_prompt(ctx: &ProactivePromptContext<'_>, tokens: &DirectiveConfig) -> String {
    let rfc = |at: DateTime<Utc>| at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut current_ids = Vec::new();
    if !ctx.current_channel_id.trim().is_empty() {
        current_ids.push(format!("- current_channel_id: {}", ctx.current_channel_id.trim()));
    }
    if !ctx.current_record_id.trim().is_empty() {
        current_ids.push(format!("- current_record_id: {}", ctx.current_record_id.trim()));
    }

    format!(
        "You may send ONE proactive message to the user, or decide to send nothing.\n\n\
         Rules:\n\
         - If you decide to send nothing, output exactly {silence} and nothing else.\n\
         - If you decide to send, output only the message content \
         (no {want_more} / {proactive} directives, no final_mood line).\n\
         - Avoid repeating what was already discussed; \
         do not interrupt if the user already continued the topic.\n\
         ===\n\n\
         Scheduling context:\n\
         - now: {now}\n\
         - added_at: {added}\n\
         - request_at: {request}\n\
         - reason: {reason}\n\
         - record_id: {record}\n\n\
         Current conversation context (may differ from this scheduled request):\n\
         {current_ids}\n\
         ===\n\n\
         Scheduled session record (when the request was created):\n\
         {scheduled}\n\n\
         Session summaries between the scheduled request and now:\n\
         {summaries}\n\n\
         Recent current session record:\n\
         {current}",
        silence = tokens.silence_token,
        want_more = tokens.want_more_token,
        proactive = tokens.proactive_prefix,
        now = rfc(ctx.now),
        added = rfc(ctx.added_at),
        request = rfc(ctx.request_at),
        reason = ctx.reason.trim(),
        record = ctx.record_id.trim(),
        current_ids = current_ids.join("\n"),
        scheduled = ctx.scheduled_record_text.trim(),
        summaries = ctx.intermediate_summaries.trim(),
        current = ctx.current_record_text.trim(),
    )
    .trim()
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use confidant_memory::{Fact, Mood, Summary};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 3, h, m, 0).unwrap()
    }

    fn msg(id: &str, author: &str, content: &str, when: Option<DateTime<Utc>>) -> ChannelMessage {
        ChannelMessage {
            id: id.into(),
            author_id: author.into(),
            author_name: author.to_uppercase(),
            content: content.into(),
            created_at: when,
            record_id: "r1".into(),
        }
    }

    #[test]
    fn context_prompt_has_all_layers() {
        let meta = SessionMetadata {
            session_start_datetime: "2026-02-03 18:00".into(),
            time_since_last_message: "~5m".into(),
            user_activity_frequency: "Active recently".into(),
            initial_mood: Mood::new(0.25, -0.125),
            ..SessionMetadata::default()
        };
        let facts = FactsFile {
            facts: vec![Fact {
                id: "F00aa".into(),
                content: "likes tea".into(),
                ..Fact::default()
            }],
        };
        let summaries = SummariesFile {
            summaries: vec![Summary {
                id: "S01".into(),
                record_id: "r0".into(),
                summary: "hello".into(),
                created_at: None,
            }],
        };
        let out = build_context_prompt("RULES", &meta, &facts, &summaries);
        assert!(out.starts_with("RULES\n\n### L2 Session Metadata\n"));
        assert!(out.contains("time_since_last_message: ~5m\n"));
        assert!(out.contains("initial_mood: {\"valence\": 0.2500, \"arousal\": -0.1250}"));
        assert!(out.contains("### L3 User Memory (Facts)\nF00aa: likes tea"));
        assert!(out.ends_with("### L4 Recent Summaries\nS01: hello (RecordID=r0)"));
    }

    #[test]
    fn empty_memory_renders_none() {
        let out = build_context_prompt(
            "",
            &SessionMetadata::default(),
            &FactsFile::default(),
            &SummariesFile::default(),
        );
        assert!(out.contains("### L3 User Memory (Facts)\n(none)"));
        assert!(out.ends_with("(none)"));
    }

    #[test]
    fn instructions_embed_tokens() {
        let stickers = ["Wave".to_string(), "Nod".to_string()];
        let text = developer_instructions(&DirectiveConfig::default(), &stickers);
        assert!(text.contains("exactly <SILENCE>"));
        assert!(text.contains("<WANT_MORE>"));
        assert!(text.contains("<PROACTIVE>{\"delay_seconds\":180"));
        assert!(text.contains("Available stickers: Wave, Nod"));
    }

    #[test]
    fn history_maps_roles_and_tags_users() {
        let zone = Zone::parse("+08:00");
        let msgs = vec![
            msg("m1", "u1", "hi there", Some(at(10, 5))),
            msg("m2", "bot", "hello!", Some(at(10, 6))),
            msg("m3", "u1", "   ", None),
        ];
        let out = build_history_messages(&msgs, "bot", &zone);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].content,
            "<speaker username=\"U1\" user_id=\"u1\" time=\"18:05\"/>\nhi there"
        );
        assert_eq!(out[1], ChatMessage::assistant("hello!"));
    }

    #[test]
    fn speaker_tag_is_sanitized() {
        let line = speaker_meta_line("<a\"b>\n", "", None, &Zone::default());
        assert_eq!(line, "<speaker username=\"(a'b)\" user_id=\"unknown\"/>");
    }

    #[test]
    fn session_record_format() {
        assert_eq!(format_session_record(&[]), "(empty)");
        let mut anon = msg("m2", "", "no author", None);
        anon.author_name.clear();
        let text = format_session_record(&[msg("m1", "u1", " hi ", Some(at(1, 2))), anon]);
        assert_eq!(text, "[m1] 2026-02-03T01:02:00Z U1: hi\n[m2]  unknown: no author");
    }

    #[test]
    fn proactive_prompt_includes_context() {
        let ctx = ProactivePromptContext {
            now: at(12, 0),
            added_at: at(11, 0),
            request_at: at(11, 30),
            reason: " check in ",
            record_id: "r1",
            current_channel_id: "c1",
            current_record_id: "",
            scheduled_record_text: "[m1] ... hi",
            intermediate_summaries: "",
            current_record_text: "(empty)",
        };
        let out = proactive_prompt(&ctx, &DirectiveConfig::default());
        assert!(out.contains("output exactly <SILENCE> and nothing else"));
        assert!(out.contains("- request_at: 2026-02-03T11:30:00Z\n- reason: check in\n"));
        assert!(out.contains("- current_channel_id: c1\n==="));
        assert!(out.ends_with("Recent current session record:\n(empty)"));
    }

    #[test]
    fn persona_default() {
        assert_eq!(persona_or_default("  "), DEFAULT_PERSONA);
        assert_eq!(persona_or_default(" Be kind. "), "Be kind.");
    }
}

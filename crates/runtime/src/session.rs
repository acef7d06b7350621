//! Per-user session timing: detects rollovers and refreshes the metadata
//! that seeds each turn's prompt.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use chrono_tz::Tz;
use tracing::warn;

use confidant_config::MoodConfig;
use confidant_memory::{Mood, SessionMetadata, initial_mood};

pub const TIME_SINCE_PREFIX: &str = "~";
pub const TIME_SINCE_UNKNOWN: &str = "unknown";
pub const SESSION_START_FORMAT: &str = "%Y-%m-%d %H:%M";

// ── Time zone ────────────────────────────────────────────────────────────────

/// Display zone for session timestamps: a fixed offset or an IANA name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Default for Zone {
    fn default() -> Self {
        Self::Named(chrono_tz::UTC)
    }
}

impl Zone {
    /// Accepts `Z`, `UTC`, `+08:00`, `+0800`, `+8`, `UTC+8`, `GMT-03:30` and
    /// IANA names.  Unrecognized input falls back to UTC with a warning.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(offset) = parse_fixed_offset(raw) {
            return Self::Fixed(offset);
        }
        match raw.parse::<Tz>() {
            Ok(tz) => Self::Named(tz),
            Err(_) => {
                warn!(tz = raw, "unrecognised timezone, falling back to UTC");
                Self::default()
            }
        }
    }

    pub fn format(&self, at: DateTime<Utc>, fmt: &str) -> String {
        match self {
            Self::Fixed(offset) => at.with_timezone(offset).format(fmt).to_string(),
            Self::Named(tz) => at.with_timezone(tz).format(fmt).to_string(),
        }
    }
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let upper = raw.to_ascii_uppercase();
    let rest = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    if rest.is_empty() || rest == "Z" {
        return (!upper.is_empty()).then(|| FixedOffset::east_opt(0)).flatten();
    }

    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit()) => {
            (digits[..2].parse().ok()?, digits[2..].parse().ok()?)
        }
        None => (digits.parse::<i32>().ok()?, 0),
    };
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

// ── Timing ───────────────────────────────────────────────────────────────────

/// Compact rendering: `45s`, `12m`, `3h 5m`, `2d 4h`.
pub fn humanize_duration(d: TimeDelta) -> String {
    let secs = d.num_seconds().max(0);
    let (days, hours, mins) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingOutcome {
    /// `now - last_message_at`, floored at zero; zero when there was none.
    pub delta: TimeDelta,
    /// Record id before this turn touched the metadata.
    pub prev_record_id: String,
    pub new_session: bool,
}

/// First step of a turn: compute elapsed time and decide whether this
/// message opens a new session.
pub fn apply_timing(
    meta: &mut SessionMetadata,
    channel_id: &str,
    now: DateTime<Utc>,
    gap: TimeDelta,
) -> TimingOutcome {
    let prev_record_id = meta.record_id.clone();
    if meta.channel_id.is_empty() {
        meta.channel_id = channel_id.to_string();
    }

    let delta = match meta.last_message_at {
        Some(last) => {
            let delta = (now - last).max(TimeDelta::zero());
            meta.time_since_last_message =
                format!("{TIME_SINCE_PREFIX}{}", humanize_duration(delta));
            delta
        }
        None => {
            meta.time_since_last_message = TIME_SINCE_UNKNOWN.to_string();
            TimeDelta::zero()
        }
    };

    let new_session = meta.record_id.is_empty() || meta.last_message_at.is_none() || delta > gap;
    TimingOutcome { delta, prev_record_id, new_session }
}

/// What the history source reports about the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionObservation<'a> {
    pub channel_id: &'a str,
    pub record_id: &'a str,
    pub start_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// True when the activity summary should be looked up again.
pub fn activity_refresh_needed(
    meta: &SessionMetadata,
    prev_record_id: &str,
    record_id: &str,
) -> bool {
    meta.user_activity_frequency.trim().is_empty() || prev_record_id.trim() != record_id.trim()
}

/// Store a freshly fetched activity summary; failed or blank lookups keep
/// the current value, or `default` when there is none.
pub fn apply_activity(meta: &mut SessionMetadata, fetched: Option<String>, default: &str) {
    match fetched.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(freq) => meta.user_activity_frequency = freq,
        None if meta.user_activity_frequency.trim().is_empty() => {
            meta.user_activity_frequency = default.to_string();
        }
        None => {}
    }
}

/// Second step of a turn: record the live session and seed the mood.
pub fn update_session_state(
    meta: &mut SessionMetadata,
    obs: &SessionObservation<'_>,
    timing: &TimingOutcome,
    zone: &Zone,
    mood: &MoodConfig,
) {
    meta.record_id = obs.record_id.to_string();
    meta.start_at = Some(obs.start_at);
    meta.last_message_at = Some(obs.now);
    meta.channel_id = obs.channel_id.to_string();
    meta.session_start_datetime = zone.format(obs.start_at, SESSION_START_FORMAT);

    if timing.prev_record_id.trim() != obs.record_id.trim() {
        meta.last_fact_record_id.clear();
        meta.last_fact_processed_at = None;
    }

    let baseline = meta.baseline_mood.unwrap_or_else(|| Mood::baseline(mood));
    meta.initial_mood = initial_mood(baseline, meta.final_mood, timing.delta, mood.decay_per_hour);
}

//! Two-axis affect carried between turns.
//!
//! Each turn starts from a mood that has relaxed exponentially from the
//! previous turn's final mood toward the configured baseline.  Values are
//! not clamped.

use std::sync::OnceLock;

use chrono::TimeDelta;
use regex::Regex;
use serde::{Deserialize, Serialize};

use confidant_config::MoodConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mood {
    pub valence: f64,
    pub arousal: f64,
}

impl Mood {
    pub fn new(valence: f64, arousal: f64) -> Self {
        Self { valence, arousal }
    }

    pub fn baseline(cfg: &MoodConfig) -> Self {
        Self::new(cfg.baseline_valence, cfg.baseline_arousal)
    }
}

/// `baseline + (last_final - baseline) * e^(-k * hours)` per axis.
///
/// `elapsed` below zero counts as zero; a missing `last_final` means the
/// user has never closed a turn and the baseline is returned.
pub fn initial_mood(
    baseline: Mood,
    last_final: Option<Mood>,
    elapsed: TimeDelta,
    k_per_hour: f64,
) -> Mood {
    let last = last_final.unwrap_or(baseline);
    let hours = (elapsed.num_milliseconds() as f64 / 3_600_000.0).max(0.0);
    let decay = (-k_per_hour * hours).exp();
    Mood {
        valence: baseline.valence + (last.valence - baseline.valence) * decay,
        arousal: baseline.arousal + (last.arousal - baseline.arousal) * decay,
    }
}

fn final_mood_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)\bfinal_mood\s*:\s*(\{[^}]*\})").expect("final_mood pattern is valid")
    })
}

/// Find a `final_mood: {...}` marker, parse it, and strip it from the text.
///
/// When the marker is absent or its object does not parse, the trimmed text
/// is returned unchanged with `None`.
pub fn extract_final_mood(content: &str) -> (String, Option<Mood>) {
    let s = content.trim();
    let Some(caps) = final_mood_pattern().captures(s) else {
        return (s.to_string(), None);
    };
    let (Some(whole), Some(obj)) = (caps.get(0), caps.get(1)) else {
        return (s.to_string(), None);
    };
    let Ok(mood) = serde_json::from_str::<Mood>(obj.as_str()) else {
        return (s.to_string(), None);
    };

    let clean = format!("{}{}", &s[..whole.start()], &s[whole.end()..]);
    (clean.trim().to_string(), Some(mood))
}

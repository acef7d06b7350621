use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Condensed recap of one finished session record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Summary {
    #[serde(rename = "summaryId")]
    pub id: String,
    #[serde(rename = "recordId")]
    pub record_id: String,
    pub summary: String,
    #[serde(rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummariesFile {
    pub summaries: Vec<Summary>,
}

impl SummariesFile {
    pub fn contains_record(&self, record_id: &str) -> bool {
        let record_id = record_id.trim();
        self.summaries.iter().any(|s| s.record_id.trim() == record_id)
    }
}

const SUMMARY_ID_CEILING: u32 = 99;

fn parse_summary_number(id: &str) -> Option<u32> {
    let digits = id.trim().strip_prefix('S').or_else(|| id.trim().strip_prefix('s'))?;
    digits.parse().ok()
}

/// `S01`, `S02`, ... one past the highest existing number.  Once the
/// ceiling is reached it is reused.
pub fn next_summary_id(existing: &[Summary]) -> String {
    let highest = existing
        .iter()
        .filter_map(|s| parse_summary_number(&s.id))
        .max()
        .unwrap_or(0);
    let next = (highest + 1).min(SUMMARY_ID_CEILING);
    format!("S{next:02}")
}

/// Append a summary for `record_id` and keep the newest `max` entries.
///
/// No-op when either input is blank or the record already has a summary.
pub fn append_summary(
    now: DateTime<Utc>,
    mut existing: SummariesFile,
    record_id: &str,
    text: &str,
    max: usize,
) -> SummariesFile {
    let record_id = record_id.trim();
    let text = text.trim();
    if record_id.is_empty() || text.is_empty() || existing.contains_record(record_id) {
        return existing;
    }

    let id = next_summary_id(&existing.summaries);
    existing.summaries.push(Summary {
        id,
        record_id: record_id.to_string(),
        summary: text.to_string(),
        created_at: Some(now),
    });

    if max > 0 && existing.summaries.len() > max {
        let excess = existing.summaries.len() - max;
        existing.summaries.drain(..excess);
    }
    existing
}

/// Summaries created inside `[start, end]`, oldest first, at most the
/// `max` most recent.  One line per summary:
/// `S03 [2026-01-01T10:00:00Z] (RecordID=r7): text`.
pub fn summaries_between(
    summaries: &[Summary],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max: usize,
) -> String {
    let mut picked: Vec<(&Summary, DateTime<Utc>)> = summaries
        .iter()
        .filter(|s| !s.summary.trim().is_empty())
        .filter_map(|s| s.created_at.map(|at| (s, at)))
        .filter(|(_, at)| *at >= start && *at <= end)
        .collect();
    picked.sort_by_key(|(_, at)| *at);
    if max > 0 && picked.len() > max {
        picked.drain(..picked.len() - max);
    }

    picked
        .into_iter()
        .map(|(s, at)| {
            let id = if s.id.trim().is_empty() { "S??" } else { s.id.trim() };
            let record = if s.record_id.trim().is_empty() { "unknown" } else { s.record_id.trim() };
            format!(
                "{id} [{}] (RecordID={record}): {}",
                at.to_rfc3339_opts(SecondsFormat::Secs, true),
                s.summary.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `S01: text (RecordID=r)` per line for prompts, `(none)` when empty.
/// The record suffix is omitted when the record id is blank.
pub fn format_summaries_for_context(file: &SummariesFile) -> String {
    let lines: Vec<String> = file
        .summaries
        .iter()
        .filter(|s| !s.id.trim().is_empty() && !s.summary.trim().is_empty())
        .map(|s| match s.record_id.trim() {
            "" => format!("{}: {}", s.id.trim(), s.summary.trim()),
            rid => format!("{}: {} (RecordID={rid})", s.id.trim(), s.summary.trim()),
        })
        .collect();
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

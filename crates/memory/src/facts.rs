use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A durable piece of information about a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fact {
    #[serde(rename = "factId")]
    pub id: String,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastAccessedAt")]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl Fact {
    /// Recency used for eviction: last touch, or creation when never touched.
    fn recency(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactsFile {
    pub facts: Vec<Fact>,
}

// ── Id allocation ────────────────────────────────────────────────────────────

const FACT_ID_SPACE: u32 = 0x1_0000;
const RANDOM_ID_TRIES: usize = 32;

fn format_fact_id(n: u32) -> String {
    format!("F{n:04x}")
}

/// Pick an unused `Fxxxx` id.  Random draws first, then a linear scan of
/// the whole space; `None` only when every id is taken.
pub fn allocate_fact_id<R: Rng + ?Sized>(rng: &mut R, taken: &HashSet<String>) -> Option<String> {
    for _ in 0..RANDOM_ID_TRIES {
        let id = format_fact_id(rng.gen_range(0..FACT_ID_SPACE));
        if !taken.contains(&id.to_ascii_lowercase()) {
            return Some(id);
        }
    }
    (0..FACT_ID_SPACE)
        .map(format_fact_id)
        .find(|id| !taken.contains(&id.to_ascii_lowercase()))
}

// ── Merge / touch / cap ──────────────────────────────────────────────────────

/// Merge newly extracted facts into `existing`.
///
/// Blank and duplicate contents (case-insensitive, trimmed) are skipped.
/// New facts get fresh ids with `created_at = last_accessed_at = now`.  The
/// result is trimmed to `max` by evicting the least recently used facts.
pub fn upsert_facts(
    now: DateTime<Utc>,
    mut existing: FactsFile,
    new_facts: &[String],
    max: usize,
) -> FactsFile {
    let mut rng = rand::thread_rng();
    let mut seen: HashSet<String> = existing
        .facts
        .iter()
        .map(|f| f.content.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    let mut taken: HashSet<String> = existing
        .facts
        .iter()
        .map(|f| f.id.trim().to_ascii_lowercase())
        .collect();

    for raw in new_facts {
        let content = raw.trim();
        let key = content.to_lowercase();
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        let Some(id) = allocate_fact_id(&mut rng, &taken) else {
            warn!(content, "fact id space exhausted, dropping fact");
            continue;
        };
        taken.insert(id.to_ascii_lowercase());
        existing.facts.push(Fact {
            id,
            content: content.to_string(),
            created_at: now,
            last_accessed_at: Some(now),
        });
    }

    existing.facts = cap_facts(existing.facts, max);
    existing
}

/// Drop the least recently used facts until at most `max` remain.
/// Survivors keep their original order; `max == 0` disables the cap.
pub fn cap_facts(facts: Vec<Fact>, max: usize) -> Vec<Fact> {
    if max == 0 || facts.len() <= max {
        return facts;
    }
    let excess = facts.len() - max;
    let mut order: Vec<usize> = (0..facts.len()).collect();
    order.sort_by_key(|&i| (facts[i].recency(), i));
    let evicted: HashSet<usize> = order.into_iter().take(excess).collect();

    facts
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !evicted.contains(i))
        .map(|(_, f)| f)
        .collect()
}

/// Mark the facts the model reported using.  Ids match case-insensitively.
pub fn touch_facts(facts: &mut [Fact], used_ids: &[String], now: DateTime<Utc>) {
    let wanted: HashSet<String> = used_ids
        .iter()
        .map(|id| id.trim().to_ascii_uppercase())
        .filter(|id| !id.is_empty())
        .collect();
    if wanted.is_empty() {
        return;
    }
    for fact in facts.iter_mut() {
        if wanted.contains(&fact.id.trim().to_ascii_uppercase()) {
            fact.last_accessed_at = Some(now);
        }
    }
}

/// `ID: content` per line for prompts, `(none)` when empty.
pub fn format_facts_for_context(file: &FactsFile) -> String {
    let lines: Vec<String> = file
        .facts
        .iter()
        .filter(|f| !f.id.trim().is_empty() && !f.content.trim().is_empty())
        .map(|f| format!("{}: {}", f.id.trim(), f.content.trim()))
        .collect();
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

pub mod cognitive;
pub mod facts;
pub mod metadata;
pub mod mood;
pub mod store;
pub mod summaries;

pub use cognitive::{FactExtraction, extract_facts, parse_fact_extraction, summarize_record};
pub use facts::{Fact, FactsFile, format_facts_for_context, touch_facts, upsert_facts};
pub use metadata::SessionMetadata;
pub use mood::{Mood, extract_final_mood, initial_mood};
pub use store::{Document, FileBackend, StateBackend, StateStore};
pub use summaries::{
    Summary, SummariesFile, append_summary, format_summaries_for_context, summaries_between,
};

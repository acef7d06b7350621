//! Model-backed memory maintenance: record summarization and fact
//! extraction.  Both go through the shared retry wrapper; callers treat
//! failures as "leave memory untouched".

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use confidant_llm::{
    ChatCompleter, ChatMessage, RetryPolicy, extract_json_output, preview, retry_async,
};

use crate::facts::{FactsFile, format_facts_for_context};

const SUMMARIZE_SYSTEM: &str = "You are a conversation summarizer. Summarize the session \
record into 1-3 sentences, focusing on user intent, key events, and emotional tone. Return \
plain text only.";

const EXTRACT_SYSTEM: &str = "You are a fact extraction engine. Extract stable, user-specific \
facts (preferences, relationships, plans, biography, recurring habits) from the conversation. \
Write each fact as one short sentence in the user's language. Skip small talk, one-off moods, \
and anything already covered by an existing fact. Also identify which existing facts were \
mentioned or strongly implied in the conversation.";

/// Result of one extraction call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactExtraction {
    pub facts: Vec<String>,
    pub used_fact_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExtractionWire {
    Object {
        #[serde(default)]
        facts: Vec<String>,
        #[serde(default)]
        used_fact_ids: Vec<String>,
    },
    List(Vec<String>),
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Decode a model reply into a [`FactExtraction`].  Accepts the documented
/// object, a bare array of fact strings, and either wrapped in a code fence.
pub fn parse_fact_extraction(raw: &str) -> Option<FactExtraction> {
    let wire: ExtractionWire = extract_json_output(raw)?;
    let (facts, used) = match wire {
        ExtractionWire::Object { facts, used_fact_ids } => (facts, used_fact_ids),
        ExtractionWire::List(facts) => (facts, Vec::new()),
    };
    Some(FactExtraction {
        facts: clean_list(facts),
        used_fact_ids: clean_list(used),
    })
}

/// Summarize a finished session record in one to three sentences.
pub async fn summarize_record(
    llm: &dyn ChatCompleter,
    policy: &RetryPolicy,
    token: &CancellationToken,
    record_text: &str,
) -> Result<String> {
    let record_text = record_text.trim();
    if record_text.is_empty() {
        bail!("record text is empty");
    }
    let messages = [
        ChatMessage::system(SUMMARIZE_SYSTEM),
        ChatMessage::user(format!("Session Record:\n{record_text}")),
    ];

    let summary = retry_async(policy, token, "summarize_record", || async {
        let response = llm.complete(&messages, None).await?;
        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(anyhow!("summarizer returned empty text"));
        }
        Ok::<_, anyhow::Error>(text)
    })
    .await?;

    info!(summary = %preview(&summary, 160), "record summarized");
    Ok(summary)
}

/// Extract new facts from `session_text` and report which existing facts
/// the conversation relied on.
pub async fn extract_facts(
    llm: &dyn ChatCompleter,
    policy: &RetryPolicy,
    token: &CancellationToken,
    session_text: &str,
    existing: &FactsFile,
) -> Result<FactExtraction> {
    let session_text = session_text.trim();
    if session_text.is_empty() {
        return Ok(FactExtraction::default());
    }
    let user_prompt = format!(
        "Conversation:\n{session_text}\n\nExisting facts (ID: content):\n{}\n\n\
         Return ONLY a JSON object like:\n\
         {{\"facts\": [\"...\"], \"used_fact_ids\": [\"F01\", \"F02\"]}}\n",
        format_facts_for_context(existing)
    );
    let messages = [ChatMessage::system(EXTRACT_SYSTEM), ChatMessage::user(user_prompt)];

    let extraction = retry_async(policy, token, "extract_facts", || async {
        let response = llm.complete(&messages, None).await?;
        parse_fact_extraction(&response.content).ok_or_else(|| {
            anyhow!(
                "fact extraction output is not JSON: {}",
                preview(&response.content, 160)
            )
        })
    })
    .await?;

    debug!(
        new_facts = extraction.facts.len(),
        used = extraction.used_fact_ids.len(),
        "facts extracted"
    );
    Ok(extraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use confidant_llm::{ChatResponse, LlmError};

    /// Pops scripted replies in order; records every prompt it saw.
    struct ScriptedLlm {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatCompleter for ScriptedLlm {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: Option<&serde_json::Value>,
        ) -> Result<ChatResponse, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LlmError::Permanent("script exhausted".into())));
            next.map(|content| ChatResponse { content, tool_calls: Vec::new() })
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn parses_object_and_bare_array() {
        let raw = r#"{"facts":[" likes tea ",""],"used_fact_ids":["F0a1b"]}"#;
        let out = parse_fact_extraction(raw).unwrap();
        assert_eq!(out.facts, vec!["likes tea"]);
        assert_eq!(out.used_fact_ids, vec!["F0a1b"]);

        let out = parse_fact_extraction("```json\n[\"has a cat\"]\n```").unwrap();
        assert_eq!(out.facts, vec!["has a cat"]);
        assert!(out.used_fact_ids.is_empty());

        assert!(parse_fact_extraction("nothing to add").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn summarize_retries_empty_output() {
        let llm =
            ScriptedLlm::new(vec![Ok("   ".into()), Ok("User planned a trip to Kyoto.".into())]);
        let token = CancellationToken::new();
        let out = summarize_record(&llm, &policy(), &token, "[m1] ... user: going to Kyoto")
            .await
            .unwrap();
        assert_eq!(out, "User planned a trip to Kyoto.");
        assert_eq!(llm.calls(), 2);

        let seen = llm.seen.lock().unwrap();
        assert!(seen[0][1].content.starts_with("Session Record:\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn summarize_gives_up_after_budget() {
        let llm = ScriptedLlm::new(vec![
            Err(LlmError::Transient("timeout".into())),
            Err(LlmError::Transient("timeout".into())),
            Err(LlmError::Transient("timeout".into())),
        ]);
        let token = CancellationToken::new();
        assert!(summarize_record(&llm, &policy(), &token, "text").await.is_err());
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn summarize_rejects_empty_record_without_calling() {
        let llm = ScriptedLlm::new(vec![]);
        let token = CancellationToken::new();
        assert!(summarize_record(&llm, &policy(), &token, "  ").await.is_err());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extract_includes_existing_facts_and_parses_reply() {
        let llm = ScriptedLlm::new(vec![
            Ok("not json".into()),
            Ok(r#"{"facts":["Works night shifts"],"used_fact_ids":["F0001"]}"#.into()),
        ]);
        let token = CancellationToken::new();
        let existing = FactsFile {
            facts: vec![crate::facts::Fact {
                id: "F0001".into(),
                content: "Lives in Osaka".into(),
                ..Default::default()
            }],
        };
        let out = extract_facts(&llm, &policy(), &token, "user: night shift again", &existing)
            .await
            .unwrap();
        assert_eq!(out.facts, vec!["Works night shifts"]);
        assert_eq!(out.used_fact_ids, vec!["F0001"]);

        let seen = llm.seen.lock().unwrap();
        assert!(seen[0][1].content.contains("F0001: Lives in Osaka"));
    }

    #[tokio::test]
    async fn permanent_llm_error_is_not_retried() {
        let llm = ScriptedLlm::new(vec![Err(LlmError::Permanent("401".into()))]);
        let token = CancellationToken::new();
        let out = extract_facts(&llm, &policy(), &token, "hi", &FactsFile::default()).await;
        assert!(out.is_err());
        assert_eq!(llm.calls(), 1);
    }
}

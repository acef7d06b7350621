//! Model calls for a turn: the retry wrapper and the tool-calling loop.
//!
//! The model may ask for tools up to `max_tool_calls` times.  Every round
//! appends the assistant's tool-call message and one tool-role result per
//! call, then re-invokes the model.  The final round is sent without tool
//! schemas so the model has to answer in text.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use confidant_config::DirectiveConfig;
use confidant_llm::{
    ChatCompleter, ChatMessage, ChatResponse, RetryPolicy, ToolCall, preview, retry_async,
};
use confidant_memory::{Mood, extract_final_mood};
use confidant_tools::{ToolHandlers, builtin_specs, dispatch_tool, specs_to_openai_tools};

use crate::directives::parse_reply;

/// Receives assistant text that came back together with tool calls.
#[async_trait]
pub trait PreludeSink: Send + Sync {
    async fn prelude(&self, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyOutcome {
    /// Reply with the `final_mood` marker removed; directives still present.
    pub text: String,
    pub final_mood: Option<Mood>,
    pub tool_calls: usize,
}

pub struct ReplyOrchestrator {
    llm: Arc<dyn ChatCompleter>,
    policy: RetryPolicy,
    max_tool_calls: usize,
    tools: Value,
    directives: DirectiveConfig,
    token: CancellationToken,
}

impl ReplyOrchestrator {
    pub fn new(
        llm: Arc<dyn ChatCompleter>,
        policy: RetryPolicy,
        max_tool_calls: usize,
        directives: &DirectiveConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            llm,
            policy,
            max_tool_calls,
            tools: specs_to_openai_tools(&builtin_specs()),
            directives: directives.clone(),
            token,
        }
    }

    pub fn llm(&self) -> &dyn ChatCompleter {
        self.llm.as_ref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// One completion under the shared retry policy.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&Value>,
    ) -> Result<ChatResponse> {
        let response = retry_async(&self.policy, &self.token, "chat completion", || {
            self.llm.complete(messages, tools)
        })
        .await?;
        Ok(response)
    }

    /// Completion without tools, returning only the text.
    pub async fn complete_text(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self.complete(messages, None).await?;
        debug!(preview = %preview(&response.content, 240), "llm output");
        Ok(response.content)
    }

    /// Run the tool loop over `messages` until the model answers in text.
    pub async fn chat_with_tools(
        &self,
        mut messages: Vec<ChatMessage>,
        handlers: &dyn ToolHandlers,
        prelude: Option<&dyn PreludeSink>,
    ) -> Result<ReplyOutcome> {
        let mut used = 0usize;
        let mut round = 0usize;

        loop {
            let remaining = self.max_tool_calls.saturating_sub(used);
            let tools = (remaining > 0).then_some(&self.tools);
            debug!(round, messages = messages.len(), tools = tools.is_some(), "llm call");

            let response = self.complete(&messages, tools).await?;
            debug!(round, preview = %preview(&response.content, 240), "llm output");

            if tools.is_none() || response.tool_calls.is_empty() {
                if !response.tool_calls.is_empty() {
                    warn!(
                        round,
                        count = response.tool_calls.len(),
                        "tool calls after budget spent, ignored"
                    );
                }
                let (text, final_mood) = extract_final_mood(&response.content);
                if let Some(mood) = final_mood {
                    debug!(valence = mood.valence, arousal = mood.arousal, "final_mood parsed");
                }
                return Ok(ReplyOutcome { text, final_mood, tool_calls: used });
            }

            let mut calls = response.tool_calls;
            if calls.len() > remaining {
                warn!(requested = calls.len(), remaining, "truncating tool calls to budget");
                calls.truncate(remaining);
            }
            used += calls.len();
            info!(round, count = calls.len(), "model requested tools");

            let interim = self.interim_text(&response.content);
            if let Some(sink) = prelude {
                if !interim.is_empty() {
                    sink.prelude(&interim).await?;
                }
            }

            messages.push(ChatMessage::assistant_tool_calls(interim, calls.clone()));
            for (call, result) in calls.iter().zip(self.run_tools(handlers, &calls).await) {
                messages.push(ChatMessage::tool_result(&call.id, result.to_string()));
            }
            round += 1;
        }
    }

    /// Assistant text accompanying tool calls, without mood or directives.
    fn interim_text(&self, content: &str) -> String {
        let (without_mood, _) = extract_final_mood(content);
        let (clean, _) = parse_reply(&without_mood, &self.directives);
        if clean.trim() == self.directives.silence_token {
            return String::new();
        }
        clean
    }

    async fn run_tools(&self, handlers: &dyn ToolHandlers, calls: &[ToolCall]) -> Vec<Value> {
        join_all(calls.iter().map(|call| async move {
            let args = preview(&call.arguments.to_string(), 240);
            debug!(tool = %call.name, %args, "tool call");
            let result = dispatch_tool(handlers, &call.name, &call.arguments).await;
            debug!(tool = %call.name, result = %preview(&result.to_string(), 240), "tool result");
            result
        }))
        .await
    }
}

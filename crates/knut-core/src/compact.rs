// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;
use tracing::{debug, warn};

use knut_model::{CompletionRequest, ContentBlock, Message, ModelProvider, Role, StreamEvent};

use crate::session::Session;

/// Prompt sent (tool-free) to produce the replacement summary.
const SUMMARY_PROMPT: &str = "Summarize the conversation so far for your own future reference: \
the task, key decisions, files and commands involved, current state, and what remains. \
Be specific; this summary will replace the messages above.";

/// Statistics reported after a compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_summarized: usize,
}

/// Rolling history compaction.
///
/// When the history's estimated tokens exceed `threshold` of the usable
/// context window, the oldest messages are replaced by a single synthetic
/// assistant summary.  The most recent messages are always preserved
/// verbatim, and the split never separates a `ToolUse` from its results.
#[derive(Debug, Clone, Copy)]
pub struct Compactor {
    /// Fraction of the context window that triggers compaction.
    pub threshold: f32,
    /// Number of trailing messages preserved verbatim.
    pub keep_recent: usize,
}

impl Default for Compactor {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            keep_recent: 6,
        }
    }
}

impl Compactor {
    pub fn needs_compaction(&self, session: &Session, context_window: usize) -> bool {
        if context_window == 0 {
            return false;
        }
        let budget = (context_window as f32 * self.threshold) as usize;
        session.approx_tokens() >= budget
    }

    /// Index where the preserved tail begins.
    ///
    /// Starts `keep_recent` from the end, then moves backward while the
    /// first preserved message is a user message opening with a
    /// `ToolResult` — cutting there would orphan results whose `ToolUse`
    /// got summarized away, and the API rejects such histories.
    pub fn split_point(&self, history: &[Message]) -> usize {
        if history.len() <= self.keep_recent + 1 {
            return 0;
        }
        let mut split = history.len() - self.keep_recent;
        while split > 0 && starts_with_tool_result(&history[split]) {
            split -= 1;
        }
        split
    }

    /// Compact `session` in place when needed.  On any summary failure the
    /// original history is restored untouched.
    pub async fn maybe_compact(
        &self,
        session: &mut Session,
        model: &dyn ModelProvider,
        system: &[String],
        context_window: usize,
        max_tokens: u32,
    ) -> anyhow::Result<Option<CompactStats>> {
        if !self.needs_compaction(session, context_window) {
            return Ok(None);
        }
        let split = self.split_point(&session.history);
        if split == 0 {
            return Ok(None);
        }

        let tokens_before = session.approx_tokens();
        let old: Vec<Message> = session.history[..split].to_vec();
        let recent: Vec<Message> = session.history[split..].to_vec();

        debug!(
            summarizing = old.len(),
            preserved = recent.len(),
            "compacting history"
        );

        // Ask for the summary with only the old prefix in context.  The
        // session itself is not touched until the summary is in hand, so a
        // failed model call leaves history exactly as it was.
        let mut messages = old;
        messages.push(Message::user(SUMMARY_PROMPT));
        let request = CompletionRequest {
            model: model.model().to_string(),
            system: system.to_vec(),
            messages,
            tools: Vec::new(),
            max_tokens,
        };

        let summary = match collect_text(model, request).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("compaction summary was empty; keeping history unchanged");
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "compaction summary failed; keeping history unchanged");
                return Ok(None);
            }
        };

        let mut compacted = Vec::with_capacity(recent.len() + 1);
        compacted.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::text(format!(
                "[Earlier conversation summarized]\n{summary}"
            ))],
            usage: None,
        });
        compacted.extend(recent);
        let messages_summarized = split;
        session.history = compacted;

        Ok(Some(CompactStats {
            tokens_before,
            tokens_after: session.approx_tokens(),
            messages_summarized,
        }))
    }
}

fn starts_with_tool_result(message: &Message) -> bool {
    message.role == Role::User
        && matches!(
            message.content.first(),
            Some(ContentBlock::ToolResult { .. })
        )
}

async fn collect_text(
    model: &dyn ModelProvider,
    request: CompletionRequest,
) -> anyhow::Result<String> {
    let mut stream = model.complete(request).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::TextDelta(delta) = event? {
            text.push_str(&delta);
        }
    }
    Ok(text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use knut_model::MockModel;
    use serde_json::json;

    fn filler(words: usize) -> String {
        vec!["word"; words].join(" ")
    }

    fn session_with_tool_rounds(rounds: usize) -> Session {
        let mut s = Session::new("mock", "/w");
        for i in 0..rounds {
            s.push(Message::user(format!("step {i}: {}", filler(50))));
            s.push(Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: format!("tu_{i}"),
                name: "Bash".into(),
                input: json!({"command": "ls"}),
            }]));
            s.push(Message::user_blocks(vec![ContentBlock::tool_result(
                format!("tu_{i}"),
                filler(60),
            )]));
            s.push(Message::assistant(filler(40)));
        }
        s
    }

    #[test]
    fn small_history_never_needs_compaction() {
        let c = Compactor::default();
        let mut s = Session::new("m", "/w");
        s.push(Message::user("hi"));
        assert!(!c.needs_compaction(&s, 200_000));
        assert!(!c.needs_compaction(&s, 0), "zero window is a no-op");
    }

    #[test]
    fn threshold_triggers_compaction() {
        let c = Compactor::default();
        let s = session_with_tool_rounds(10);
        let tokens = s.approx_tokens();
        assert!(c.needs_compaction(&s, tokens), "window == usage is over 85%");
        assert!(!c.needs_compaction(&s, tokens * 10));
    }

    #[test]
    fn split_never_orphans_tool_results() {
        let c = Compactor {
            threshold: 0.85,
            keep_recent: 6,
        };
        let s = session_with_tool_rounds(8);
        let split = c.split_point(&s.history);
        assert!(split > 0);
        assert!(
            !starts_with_tool_result(&s.history[split]),
            "preserved tail must not open with an orphaned ToolResult"
        );
    }

    #[test]
    fn split_keeps_most_recent_messages() {
        let c = Compactor::default();
        let s = session_with_tool_rounds(8);
        let split = c.split_point(&s.history);
        assert!(split <= s.history.len() - c.keep_recent);
    }

    #[test]
    fn tiny_history_is_not_split() {
        let c = Compactor::default();
        let mut s = Session::new("m", "/w");
        s.push(Message::user("a"));
        s.push(Message::assistant("b"));
        assert_eq!(c.split_point(&s.history), 0);
    }

    #[tokio::test]
    async fn compaction_replaces_prefix_with_summary() {
        let c = Compactor {
            threshold: 0.1,
            keep_recent: 4,
        };
        let mock = MockModel::new();
        mock.push_text("built the parser; tests green; next: wire the CLI");

        let mut s = session_with_tool_rounds(8);
        let before_len = s.history.len();
        let last = s.history.last().cloned().unwrap();

        let stats = c
            .maybe_compact(&mut s, &mock, &["system".into()], 100, 1024)
            .await
            .unwrap()
            .expect("compaction should run");

        assert!(s.history.len() < before_len);
        assert!(stats.messages_summarized > 0);
        // The synthetic summary leads the new history.
        assert!(s.history[0].text().contains("summarized"));
        assert!(s.history[0].text().contains("built the parser"));
        // The most recent message survives verbatim.
        assert_eq!(s.history.last().unwrap(), &last);
        // The preserved tail still closes every tool use.
        assert!(s.history_is_closed());
    }

    #[tokio::test]
    async fn summary_request_is_tool_free_and_excludes_tail() {
        let c = Compactor {
            threshold: 0.1,
            keep_recent: 4,
        };
        let mock = MockModel::new();
        mock.push_text("summary");
        let mut s = session_with_tool_rounds(8);
        let original_len = s.history.len();
        let split = c.split_point(&s.history);
        c.maybe_compact(&mut s, &mock, &[], 100, 512).await.unwrap();

        let reqs = mock.requests();
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].tools.is_empty(), "summary turn carries no tools");
        let text = reqs[0]
            .messages
            .last()
            .map(Message::text)
            .unwrap_or_default();
        assert!(text.contains("Summarize"));
        // Only the old prefix plus the summary prompt went to the model.
        assert_eq!(reqs[0].messages.len(), split + 1);
        assert!(split < original_len);
    }

    #[tokio::test]
    async fn empty_summary_restores_original_history() {
        let c = Compactor {
            threshold: 0.1,
            keep_recent: 4,
        };
        let mock = MockModel::new();
        mock.push_text("");

        let mut s = session_with_tool_rounds(6);
        let original = s.history.clone();
        let stats = c
            .maybe_compact(&mut s, &mock, &[], 100, 512)
            .await
            .unwrap();
        assert!(stats.is_none());
        assert_eq!(s.history, original);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Scripted model provider for tests and offline runs.
//!
//! Each call to [`MockModel::complete`] pops the next script and streams its
//! events.  Requests are recorded so tests can assert on what the loop sent.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{CompletionRequest, EventStream, ModelProvider, StreamEvent, Usage};

#[derive(Default)]
pub struct MockModel {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw event script for one future completion call.
    pub fn push_script(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().unwrap().push_back(events);
    }

    /// Queue a plain text answer.
    pub fn push_text(&self, text: &str) {
        self.push_script(vec![
            StreamEvent::Usage(Usage {
                input_tokens: 10,
                ..Default::default()
            }),
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::Done,
        ]);
    }

    /// Queue an answer that calls one tool, streaming its input JSON in two
    /// chunks the way real providers do.
    pub fn push_tool_call(&self, id: &str, name: &str, input: &serde_json::Value) {
        let args = input.to_string();
        let (a, b) = args.split_at(args.len() / 2);
        self.push_script(vec![
            StreamEvent::ToolUseStart {
                index: 0,
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamEvent::ToolUseDelta {
                index: 0,
                partial_json: a.to_string(),
            },
            StreamEvent::ToolUseDelta {
                index: 0,
                partial_json: b.to_string(),
            },
            StreamEvent::Done,
        ]);
    }

    /// All requests observed so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockModel {
    fn model(&self) -> &str {
        "mock"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        self.requests.lock().unwrap().push(req);
        let events = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![StreamEvent::TextDelta("(no script)".into()), StreamEvent::Done]);
        Ok(Box::pin(futures::stream::iter(
            events.into_iter().map(Ok::<_, anyhow::Error>),
        )))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

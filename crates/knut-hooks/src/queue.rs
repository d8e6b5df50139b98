// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

/// Queue of prompt-hook contributions awaiting injection.
///
/// Prompt hooks enqueue strings here; the conversation loop drains the queue
/// between turns and wraps each entry in a `<system-reminder>` block on the
/// next user message.
#[derive(Debug, Default)]
pub struct PromptQueue {
    inner: Mutex<Vec<String>>,
}

impl PromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.inner.lock().unwrap().push(text);
        }
    }

    /// Take everything queued so far, in insertion order.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Render the queued entries as `<system-reminder>` blocks, draining the
    /// queue.  Returns `None` when nothing is queued.
    pub fn drain_as_reminders(&self) -> Option<String> {
        let entries = self.drain();
        if entries.is_empty() {
            return None;
        }
        Some(
            entries
                .into_iter()
                .map(|e| format!("<system-reminder>\n{e}\n</system-reminder>"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

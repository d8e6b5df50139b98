// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use knut_model::{ContentBlock, Message, Usage};

use crate::error::HostError;

/// Consumer of loop progress: the interactive renderer or the batch printer.
///
/// Callbacks fire in model-stream order for a given assistant message and
/// must not block — a slow handler may not stall the stream.
pub trait Handler: Send + Sync {
    fn on_text_delta(&self, _delta: &str) {}
    fn on_thought_delta(&self, _delta: &str) {}
    fn on_tool_use_begin(&self, _id: &str, _name: &str) {}
    fn on_tool_use_end(&self, _id: &str, _name: &str, _input: &Value) {}
    fn on_assistant_message_complete(&self, _message: &Message) {}
    fn on_tool_result(&self, _result: &ContentBlock) {}
    fn on_usage(&self, _usage: &Usage) {}
    fn on_error(&self, _error: &HostError) {}
}

/// Discards everything; useful in tests and sub-agents.
pub struct NullHandler;

impl Handler for NullHandler {}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::Write;
use std::sync::Mutex;

use serde_json::{json, Value};

use knut_core::{Handler, HostError};
use knut_model::{ContentBlock, Message, Usage};

/// Plain text: streams assistant text to stdout, tool activity to stderr.
pub struct TextHandler;

impl Handler for TextHandler {
    fn on_text_delta(&self, delta: &str) {
        print!("{delta}");
        let _ = std::io::stdout().flush();
    }

    fn on_assistant_message_complete(&self, message: &Message) {
        if !message.text().is_empty() {
            println!();
        }
    }

    fn on_tool_use_begin(&self, _id: &str, name: &str) {
        eprintln!("· running {name}");
    }

    fn on_tool_result(&self, result: &ContentBlock) {
        if let ContentBlock::ToolResult { is_error: true, content, .. } = result {
            eprintln!("· tool failed: {}", first_line(content));
        }
    }

    fn on_error(&self, error: &HostError) {
        eprintln!("error: {error}");
    }
}

/// `stream-json`: one JSON object per stream event on stdout.
pub struct StreamJsonHandler;

impl StreamJsonHandler {
    fn emit(&self, value: Value) {
        println!("{value}");
        let _ = std::io::stdout().flush();
    }
}

impl Handler for StreamJsonHandler {
    fn on_text_delta(&self, delta: &str) {
        self.emit(json!({"type": "text_delta", "text": delta}));
    }

    fn on_thought_delta(&self, delta: &str) {
        self.emit(json!({"type": "thought_delta", "text": delta}));
    }

    fn on_tool_use_begin(&self, id: &str, name: &str) {
        self.emit(json!({"type": "tool_use_begin", "id": id, "name": name}));
    }

    fn on_tool_use_end(&self, id: &str, name: &str, input: &Value) {
        self.emit(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
    }

    fn on_tool_result(&self, result: &ContentBlock) {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = result
        {
            self.emit(json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }));
        }
    }

    fn on_usage(&self, usage: &Usage) {
        self.emit(json!({
            "type": "usage",
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cache_read": usage.cache_read,
            "cache_creation": usage.cache_creation,
        }));
    }

    fn on_error(&self, error: &HostError) {
        self.emit(json!({"type": "error", "message": error.to_string()}));
    }
}

/// `json`: collects the whole turn, emitted as one document at the end.
#[derive(Default)]
pub struct JsonCollector {
    state: Mutex<CollectedTurn>,
}

#[derive(Default)]
struct CollectedTurn {
    text: String,
    tool_calls: Vec<Value>,
    errors: Vec<String>,
}

impl JsonCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The final document for the turn.
    pub fn finish(&self, status: &str, usage: &Usage) -> String {
        let state = self.state.lock().unwrap();
        let doc = json!({
            "status": status,
            "result": state.text,
            "tool_calls": state.tool_calls,
            "errors": state.errors,
            "usage": {
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "cache_read": usage.cache_read,
                "cache_creation": usage.cache_creation,
            },
        });
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Handler for JsonCollector {
    fn on_assistant_message_complete(&self, message: &Message) {
        let text = message.text();
        if !text.is_empty() {
            let mut state = self.state.lock().unwrap();
            if !state.text.is_empty() {
                state.text.push('\n');
            }
            state.text.push_str(&text);
        }
    }

    fn on_tool_use_end(&self, id: &str, name: &str, input: &Value) {
        self.state.lock().unwrap().tool_calls.push(json!({
            "id": id,
            "name": name,
            "input": input,
        }));
    }

    fn on_error(&self, error: &HostError) {
        self.state.lock().unwrap().errors.push(error.to_string());
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

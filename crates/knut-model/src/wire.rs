// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::{json, Value};

use crate::types::{CompletionRequest, ContentBlock, Message, Role, StreamEvent, Usage};

/// Build the JSON body for a streaming messages request.
///
/// The system prompt travels as a top-level field, not as a conversation
/// turn.  The first system block carries a `cache_control` marker so the
/// stable prefix is cached across requests.
pub fn build_request_body(req: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": req.model,
        "messages": req.messages.iter().map(build_message).collect::<Vec<_>>(),
        "max_tokens": req.max_tokens,
        "stream": true,
    });

    if !req.system.is_empty() {
        let blocks: Vec<Value> = req
            .system
            .iter()
            .enumerate()
            .map(|(i, text)| {
                if i == 0 {
                    json!({
                        "type": "text",
                        "text": text,
                        "cache_control": { "type": "ephemeral" },
                    })
                } else {
                    json!({ "type": "text", "text": text })
                }
            })
            .collect();
        body["system"] = json!(blocks);
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn build_message(m: &Message) -> Value {
    let role = match m.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let content: Vec<Value> = m
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
            // Reasoning is never replayed to the API.
            ContentBlock::Thought { .. } => None,
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            })),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                });
                if *is_error {
                    block["is_error"] = json!(true);
                }
                Some(block)
            }
        })
        .collect();
    json!({ "role": role, "content": content })
}

/// Parse one SSE `data:` payload into a stream event.
///
/// Returns `None` for events that carry nothing the loop cares about
/// (pings, block stops, signature deltas).
pub fn parse_stream_event(v: &Value) -> Option<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                Some(StreamEvent::ToolUseStart {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                })
            } else {
                None
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    (!text.is_empty()).then(|| StreamEvent::TextDelta(text.to_string()))
                }
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("");
                    (!text.is_empty()).then(|| StreamEvent::ThoughtDelta(text.to_string()))
                }
                "input_json_delta" => Some(StreamEvent::ToolUseDelta {
                    index,
                    partial_json: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }),
                // signature_delta is an opaque integrity blob; never surfaced.
                _ => None,
            }
        }
        "message_start" => {
            let usage = &v["message"]["usage"];
            usage.is_object().then(|| {
                StreamEvent::Usage(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                    cache_read: usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_creation: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0)
                        as u32,
                })
            })
        }
        "message_delta" => v.get("usage").map(|usage| {
            StreamEvent::Usage(Usage {
                input_tokens: 0,
                output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                cache_read: 0,
                cache_creation: 0,
            })
        }),
        "message_stop" => Some(StreamEvent::Done),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

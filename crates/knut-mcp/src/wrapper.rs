// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use knut_tools::{ExecContext, Tool, ToolCall, ToolOutput};

use crate::client::{McpClient, RemoteTool};

/// Registry adapter for one remote tool.
///
/// Registered as `mcp__<server>__<tool>`; always requires permission —
/// remote tools are never trusted to self-classify.
pub struct McpToolWrapper {
    name: String,
    remote_name: String,
    description: String,
    input_schema: Value,
    client: Arc<McpClient>,
}

impl McpToolWrapper {
    pub fn new(client: Arc<McpClient>, remote: RemoteTool) -> Self {
        Self {
            name: wrapper_name(&client.server_name, &remote.name),
            remote_name: remote.name,
            description: remote.description,
            input_schema: remote.input_schema,
            client,
        }
    }
}

/// `mcp__<server>__<tool>`.
pub fn wrapper_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

#[async_trait]
impl Tool for McpToolWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn requires_permission(&self, _input: &Value) -> bool {
        true
    }

    async fn execute(&self, ctx: &ExecContext, call: &ToolCall) -> ToolOutput {
        match self
            .client
            .call_tool(&self.remote_name, &call.args, &ctx.cancel)
            .await
        {
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

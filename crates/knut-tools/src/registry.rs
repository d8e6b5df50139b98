// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::tool::{ExecContext, Tool, ToolCall, ToolOutput};

/// Output ceiling applied to every tool result.
const OUTPUT_LIMIT_BYTES: usize = 100_000;

/// A tool definition as sent to the model with each request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Registry of the session's tools, in registration order.
///
/// Order is part of the contract: the model's tool-choice probability is
/// sensitive to enumeration order, so `definitions()` must be stable.
/// Re-registering a name replaces the handle but keeps its position.
pub struct ToolRegistry {
    slots: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&pos) => self.slots[pos] = tool,
            None => {
                self.index.insert(name, self.slots.len());
                self.slots.push(tool);
            }
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&pos| Arc::clone(&self.slots[pos]))
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Definitions for inclusion in each model request, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.slots
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute one call.  This is the single permission enforcement point:
    /// tools themselves never consult the engine.
    ///
    /// Tool-level failures come back as `Ok` with `is_error` set (they are
    /// data for the model); an unknown name or a permission denial is an
    /// error at this boundary.
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        call: &ToolCall,
    ) -> Result<ToolOutput, ExecuteError> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| ExecuteError::UnknownTool(call.name.clone()))?;

        if tool.requires_permission(&call.args) {
            ctx.gate.authorize(&call.name, &call.args, &ctx.cwd).await?;
        }

        debug!(tool = %call.name, id = %call.id, "executing tool");
        let mut output = tool.execute(ctx, call).await;
        output.content = truncate_output(output.content);
        Ok(output)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cap `content` at the output ceiling, appending an omission marker.
fn truncate_output(content: String) -> String {
    if content.len() <= OUTPUT_LIMIT_BYTES {
        return content;
    }
    // Cut on a char boundary at or below the ceiling.
    let mut end = OUTPUT_LIMIT_BYTES;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    let omitted = content.len() - end;
    format!("{}\n...[{omitted} bytes truncated]...", &content[..end])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::permission::PermissionGate;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim into the
    /// closing tool result.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when the tool failed non-fatally; fed back to the model as an
    /// error-flagged result rather than failing the turn.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Per-call execution context handed to every tool.
#[derive(Clone)]
pub struct ExecContext {
    pub cwd: PathBuf,
    /// Cancelled when the user interrupts the turn or the process shuts
    /// down; tools must stop work promptly when it fires.
    pub cancel: CancellationToken,
    pub gate: Arc<PermissionGate>,
}

impl ExecContext {
    pub fn new(cwd: PathBuf, cancel: CancellationToken, gate: Arc<PermissionGate>) -> Self {
        Self { cwd, cancel, gate }
    }
}

/// Contract every invokable tool satisfies.
///
/// Implementations never consult the permission engine themselves; the
/// executor is the single enforcement point.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    /// Whether this invocation must pass the permission engine.
    /// Read-only tools typically return `false`.
    fn requires_permission(&self, _input: &Value) -> bool {
        true
    }
    /// Execute the tool.  Failures are wrapped in [`ToolOutput::err`].
    async fn execute(&self, ctx: &ExecContext, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

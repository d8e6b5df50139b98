// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod permission;
pub mod registry;
pub mod tool;

pub use permission::{
    Behavior, Decision, DenyAllHandler, PermissionGate, PermissionHandler, PermissionPrompt,
    PermissionReply, EDIT_TOOLS, READ_ONLY_TOOLS,
};
pub use registry::{ExecuteError, ToolDefinition, ToolRegistry};
pub use tool::{ExecContext, Tool, ToolCall, ToolOutput};

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Error taxonomy for the host.
//!
//! Propagation policy: errors scoped to a single tool call become data (a
//! `ToolResult` with `is_error`) and never leave the loop; errors scoped to
//! a turn stop the turn and reach the handler through `on_error`; errors
//! scoped to the session (auth, fatal protocol) bubble out of the loop
//! entirely.

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No token anywhere; fatal for any model call.
    #[error("authentication not configured")]
    AuthNotConfigured,
    /// The API rejected our credential even after the single refresh retry.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// Connection failures, timeouts, 5xx — after bounded retries.
    #[error("network error: {0}")]
    NetworkTransient(String),
    /// Malformed streaming block or JSON-RPC message; fatal to the current
    /// call, not to the session.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("tool execution failed: {0}")]
    ToolExecution(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A `PreToolUse` or `UserPromptSubmit` hook blocked the event.
    #[error("hook blocked: {0}")]
    HookBlocked(String),
    #[error("cancelled")]
    Cancelled,
    /// Malformed settings/MCP/hook configuration; a startup warning, never
    /// a crash.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl HostError {
    /// True when the error should terminate interactive mode rather than
    /// just the current turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::AuthNotConfigured | HostError::AuthRejected(_))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_fatal_others_are_not() {
        assert!(HostError::AuthNotConfigured.is_fatal());
        assert!(HostError::AuthRejected("401".into()).is_fatal());
        assert!(!HostError::Cancelled.is_fatal());
        assert!(!HostError::HookBlocked("policy".into()).is_fatal());
        assert!(!HostError::NetworkTransient("timeout".into()).is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let e = HostError::HookBlocked("policy".into());
        assert_eq!(e.to_string(), "hook blocked: policy");
    }
}

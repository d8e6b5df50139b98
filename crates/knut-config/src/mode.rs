// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Session-scoped permission posture.  Starts at `Default` for every new
/// session, is cycled by user action, and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum PermissionMode {
    /// Ask on anything not explicitly allowed or denied.
    #[serde(rename = "default")]
    #[value(name = "default")]
    Default,
    /// Allow only read-only tools; deny everything else.
    #[serde(rename = "plan")]
    #[value(name = "plan")]
    Plan,
    /// Auto-allow edit tools; otherwise behaves like `Default`.
    #[serde(rename = "acceptEdits")]
    #[value(name = "accept-edits")]
    AcceptEdits,
    /// Allow everything.  May be administratively disabled.
    #[serde(rename = "bypassPermissions")]
    #[value(name = "bypass-permissions")]
    BypassPermissions,
    /// Allow everything; transient cycle target from `BypassPermissions`.
    #[serde(rename = "dontAsk")]
    #[value(name = "dont-ask")]
    DontAsk,
}

impl PermissionMode {
    /// Next mode on user cycling.  `bypass_available` gates whether the
    /// bypass step is offered at all.
    pub fn cycle(self, bypass_available: bool) -> Self {
        match self {
            PermissionMode::Default => PermissionMode::AcceptEdits,
            PermissionMode::AcceptEdits => PermissionMode::Plan,
            PermissionMode::Plan => {
                if bypass_available {
                    PermissionMode::BypassPermissions
                } else {
                    PermissionMode::Default
                }
            }
            PermissionMode::BypassPermissions => PermissionMode::Default,
            PermissionMode::DontAsk => PermissionMode::Default,
        }
    }

    /// True when the mode unconditionally allows every tool call.
    pub fn allows_everything(self) -> bool {
        matches!(
            self,
            PermissionMode::BypassPermissions | PermissionMode::DontAsk
        )
    }
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionMode::Default => "default",
            PermissionMode::Plan => "plan",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::DontAsk => "dontAsk",
        };
        write!(f, "{s}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `knut-hooks` — user-configured lifecycle hooks.
//!
//! Hooks attach to loop events (`PreToolUse`, `PostToolUse`,
//! `UserPromptSubmit`, `SessionStart`, `Stop`, `PermissionRequest`).
//! Command hooks run as shell subprocesses with the event context injected
//! through environment variables; a non-zero exit blocks the tool call or
//! prompt for the blocking event kinds and is only a warning elsewhere.
//! Prompt hooks contribute text that the loop injects into the model's next
//! user turn as a `<system-reminder>` block.

pub mod queue;
pub mod runner;

pub use queue::PromptQueue;
pub use runner::{HookInput, HookOutcome, HookRunner};

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Permission evaluation over tool calls.
//!
//! [`evaluate`] is pure: the same `(tool, input, mode, rules, session
//! overrides)` always yields the same decision.  [`PermissionGate`] wraps it
//! with the session-mutable state (mode, session rules) and the interactive
//! handler that resolves `Ask` decisions.

mod bash;
mod matching;
mod suggest;

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use knut_config::{PermissionAction, PermissionMode, PermissionRule};

pub use matching::rule_matches;

/// Tools classified read-only for plan mode.  An explicit enumeration, not a
/// property inferred from `requires_permission`, so the policy stays
/// auditable.
pub const READ_ONLY_TOOLS: &[&str] = &[
    "FileRead",
    "Glob",
    "Grep",
    "TodoWrite",
    "AskUserQuestion",
    "ExitPlanMode",
    "TaskOutput",
    "Config",
    "ListMcpResources",
    "ReadMcpResource",
];

/// Tools auto-allowed in `acceptEdits` mode, in addition to read-only.
pub const EDIT_TOOLS: &[&str] = &["FileEdit", "FileWrite", "NotebookEdit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Allow,
    Deny,
    Ask,
    /// Proceed without further gating (tool opted out of permissions).
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub behavior: Behavior,
    pub reason: Option<String>,
    /// Candidate rules the UI may offer to persist; at most three.
    pub suggestions: Vec<String>,
    /// Extra context shown with an `Ask` (e.g. why a command looks unsafe).
    pub message: Option<String>,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            behavior: Behavior::Allow,
            reason: Some(reason.into()),
            suggestions: Vec::new(),
            message: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            behavior: Behavior::Deny,
            reason: Some(reason.into()),
            suggestions: Vec::new(),
            message: None,
        }
    }
}

fn is_read_only(tool: &str) -> bool {
    READ_ONLY_TOOLS.contains(&tool)
}

fn is_edit_tool(tool: &str) -> bool {
    EDIT_TOOLS.contains(&tool)
}

/// Evaluate a tool call against the current policy.
///
/// `session_rules` are the live session overrides; `persisted_rules` come
/// from the settings layers already ordered for evaluation
/// (project → local → user → managed, deny before allow within each layer).
pub fn evaluate(
    tool: &str,
    input: &Value,
    mode: PermissionMode,
    session_rules: &[PermissionRule],
    persisted_rules: &[PermissionRule],
    cwd: &Path,
) -> Decision {
    // 1. Mode short-circuits.
    match mode {
        PermissionMode::BypassPermissions | PermissionMode::DontAsk => {
            return Decision::allow(format!("{mode} mode"));
        }
        PermissionMode::Plan => {
            if is_read_only(tool) {
                return Decision::allow("read-only tool in plan mode");
            }
            return Decision::deny(format!("{tool} is not permitted in plan mode"));
        }
        PermissionMode::AcceptEdits => {
            if is_read_only(tool) || is_edit_tool(tool) {
                return Decision::allow("acceptEdits mode");
            }
        }
        PermissionMode::Default => {}
    }

    // 2–4. Session overrides: deny beats allow beats ask for the same call.
    for action in [
        PermissionAction::Deny,
        PermissionAction::Allow,
        PermissionAction::Ask,
    ] {
        for rule in session_rules.iter().filter(|r| r.action == action) {
            if rule_matches(rule, tool, input, cwd) {
                debug!(tool, pattern = %rule.pattern, ?action, "session rule matched");
                return match action {
                    PermissionAction::Deny => {
                        Decision::deny(format!("session rule {}", describe(rule)))
                    }
                    PermissionAction::Allow => {
                        Decision::allow(format!("session rule {}", describe(rule)))
                    }
                    PermissionAction::Ask => ask(tool, input, Some("session rule".into())),
                };
            }
        }
    }

    // 5. Persisted rules in order; first match wins.
    for rule in persisted_rules {
        if rule_matches(rule, tool, input, cwd) {
            debug!(tool, pattern = %rule.pattern, source = ?rule.source, "persisted rule matched");
            return match rule.action {
                PermissionAction::Deny => Decision::deny(format!("rule {}", describe(rule))),
                PermissionAction::Allow => Decision::allow(format!("rule {}", describe(rule))),
                PermissionAction::Ask => ask(tool, input, None),
            };
        }
    }

    if tool == "Bash" {
        let command = bash::command_of(input);

        // 6. Built-in safety checks.
        if let Some(warning) = bash::security_check(command) {
            return ask(tool, input, Some(warning));
        }

        // 7. Pure read-only invocations run without asking.
        if bash::is_read_only_invocation(command) {
            return Decision::allow("read-only command");
        }
    }

    // 8. Default.
    ask(tool, input, None)
}

fn ask(tool: &str, input: &Value, message: Option<String>) -> Decision {
    Decision {
        behavior: Behavior::Ask,
        reason: None,
        suggestions: suggest::suggestions(tool, input),
        message,
    }
}

fn describe(rule: &PermissionRule) -> String {
    knut_config::rules::format(&rule.spec())
}

/// The user's answer to an interactive permission prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionReply {
    Allow,
    /// Allow and remember the given rule string for the rest of the session.
    AllowWithRule(String),
    Deny,
}

/// What the interactive handler is shown for an `Ask` decision.
pub struct PermissionPrompt<'a> {
    pub tool_name: &'a str,
    pub input: &'a Value,
    pub suggestions: &'a [String],
    pub message: Option<&'a str>,
}

/// Resolves `Ask` decisions — a TTY prompt in interactive mode, a fixed
/// policy in batch mode.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn request(&self, prompt: PermissionPrompt<'_>) -> PermissionReply;
}

/// Deny-everything handler for non-interactive runs.
pub struct DenyAllHandler;

#[async_trait]
impl PermissionHandler for DenyAllHandler {
    async fn request(&self, _prompt: PermissionPrompt<'_>) -> PermissionReply {
        PermissionReply::Deny
    }
}

/// Session-scoped permission state plus the interactive handler.
///
/// The engine itself stays pure; this gate owns what varies over a session:
/// the mode, the session override rules, and how `Ask` gets answered.
pub struct PermissionGate {
    persisted: Vec<PermissionRule>,
    session: Mutex<Vec<PermissionRule>>,
    mode: Mutex<PermissionMode>,
    bypass_available: bool,
    handler: Arc<dyn PermissionHandler>,
}

impl PermissionGate {
    pub fn new(
        persisted: Vec<PermissionRule>,
        mode: PermissionMode,
        bypass_available: bool,
        handler: Arc<dyn PermissionHandler>,
    ) -> Self {
        Self {
            persisted,
            session: Mutex::new(Vec::new()),
            mode: Mutex::new(mode),
            bypass_available,
            handler,
        }
    }

    pub fn mode(&self) -> PermissionMode {
        *self.mode.lock().unwrap()
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Cycle to the next mode on user action and return it.
    pub fn cycle_mode(&self) -> PermissionMode {
        let mut mode = self.mode.lock().unwrap();
        *mode = mode.cycle(self.bypass_available);
        *mode
    }

    pub fn add_session_rule(&self, rule: PermissionRule) {
        self.session.lock().unwrap().push(rule);
    }

    pub fn session_rules(&self) -> Vec<PermissionRule> {
        self.session.lock().unwrap().clone()
    }

    /// Pure evaluation with the gate's current state.
    pub fn evaluate(&self, tool: &str, input: &Value, cwd: &Path) -> Decision {
        let session = self.session.lock().unwrap();
        evaluate(tool, input, self.mode(), &session, &self.persisted, cwd)
    }

    /// Evaluate and, on `Ask`, defer to the interactive handler.
    /// `Ok(())` means the call may proceed.
    pub async fn authorize(
        &self,
        tool: &str,
        input: &Value,
        cwd: &Path,
    ) -> Result<(), crate::registry::ExecuteError> {
        use crate::registry::ExecuteError;

        let decision = self.evaluate(tool, input, cwd);
        match decision.behavior {
            Behavior::Allow | Behavior::Passthrough => Ok(()),
            Behavior::Deny => Err(ExecuteError::PermissionDenied(
                decision
                    .reason
                    .unwrap_or_else(|| format!("{tool} denied by policy")),
            )),
            Behavior::Ask => {
                let reply = self
                    .handler
                    .request(PermissionPrompt {
                        tool_name: tool,
                        input,
                        suggestions: &decision.suggestions,
                        message: decision.message.as_deref(),
                    })
                    .await;
                match reply {
                    PermissionReply::Allow => Ok(()),
                    PermissionReply::AllowWithRule(rule_str) => {
                        match knut_config::rules::parse(&rule_str) {
                            Ok(spec) => self.add_session_rule(PermissionRule::new(
                                spec.tool,
                                spec.pattern,
                                PermissionAction::Allow,
                                knut_config::RuleSource::Session,
                            )),
                            Err(e) => {
                                tracing::warn!(rule = %rule_str, error = %e,
                                    "ignoring malformed session rule from prompt reply")
                            }
                        }
                        Ok(())
                    }
                    PermissionReply::Deny => {
                        Err(ExecuteError::PermissionDenied(format!("{tool} denied by user")))
                    }
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use knut_config::{HookDef, HookEvent, HookType, HooksConfig};

use crate::queue::PromptQueue;

/// Ceiling for the `TOOL_OUTPUT` environment variable.
const TOOL_OUTPUT_ENV_LIMIT: usize = 10_000;

/// Wall-clock limit for a single command hook.
const HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Event payload passed to [`HookRunner::fire`].
#[derive(Debug, Clone, Copy)]
pub enum HookInput<'a> {
    PreToolUse {
        tool_name: &'a str,
        tool_input: &'a Value,
    },
    PostToolUse {
        tool_name: &'a str,
        tool_input: &'a Value,
        tool_output: &'a str,
        is_error: bool,
    },
    UserPromptSubmit {
        message: &'a str,
    },
    SessionStart,
    Stop,
    PermissionRequest {
        tool_name: &'a str,
        tool_input: &'a Value,
    },
}

impl HookInput<'_> {
    pub fn event(&self) -> HookEvent {
        match self {
            HookInput::PreToolUse { .. } => HookEvent::PreToolUse,
            HookInput::PostToolUse { .. } => HookEvent::PostToolUse,
            HookInput::UserPromptSubmit { .. } => HookEvent::UserPromptSubmit,
            HookInput::SessionStart => HookEvent::SessionStart,
            HookInput::Stop => HookEvent::Stop,
            HookInput::PermissionRequest { .. } => HookEvent::PermissionRequest,
        }
    }

    /// Non-zero exit blocks the event for these kinds; elsewhere it only
    /// warns.
    fn is_blocking(&self) -> bool {
        matches!(
            self,
            HookInput::PreToolUse { .. } | HookInput::UserPromptSubmit { .. }
        )
    }

    /// Event-specific variables injected into the hook environment.
    fn env(&self, message_override: Option<&str>) -> Vec<(String, String)> {
        let mut vars = vec![("HOOK_EVENT".to_string(), self.event().to_string())];
        match self {
            HookInput::PreToolUse {
                tool_name,
                tool_input,
            }
            | HookInput::PermissionRequest {
                tool_name,
                tool_input,
            } => {
                vars.push(("TOOL_NAME".into(), (*tool_name).to_string()));
                vars.push(("TOOL_INPUT".into(), tool_input.to_string()));
            }
            HookInput::PostToolUse {
                tool_name,
                tool_input,
                tool_output,
                is_error,
            } => {
                vars.push(("TOOL_NAME".into(), (*tool_name).to_string()));
                vars.push(("TOOL_INPUT".into(), tool_input.to_string()));
                vars.push((
                    "TOOL_OUTPUT".into(),
                    truncate_env(tool_output, TOOL_OUTPUT_ENV_LIMIT),
                ));
                vars.push(("TOOL_IS_ERROR".into(), is_error.to_string()));
            }
            HookInput::UserPromptSubmit { message } => {
                vars.push((
                    "USER_MESSAGE".into(),
                    message_override.unwrap_or(message).to_string(),
                ));
            }
            HookInput::SessionStart | HookInput::Stop => {}
        }
        vars
    }
}

/// Result of firing one event's hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    /// A blocking hook failed or exited non-zero; the event must not proceed.
    Blocked { message: String },
    /// `UserPromptSubmit` hooks rewrote the message.
    Replace(String),
}

/// Executes configured hooks for lifecycle events.
pub struct HookRunner {
    hooks: HooksConfig,
    queue: PromptQueue,
}

impl HookRunner {
    pub fn new(hooks: HooksConfig) -> Self {
        Self {
            hooks,
            queue: PromptQueue::new(),
        }
    }

    /// The prompt-injection queue fed by `prompt`-type hooks.
    pub fn queue(&self) -> &PromptQueue {
        &self.queue
    }

    pub fn has_hooks(&self, event: HookEvent) -> bool {
        !self.hooks.for_event(event).is_empty()
    }

    /// Fire all hooks for the event, sequentially in configured order.
    ///
    /// For `PreToolUse`, the first failing hook short-circuits the rest.
    /// For `UserPromptSubmit`, a hook's non-empty stdout replaces the
    /// message seen by subsequent hooks and by the loop.
    pub async fn fire(&self, input: HookInput<'_>, cancel: &CancellationToken) -> HookOutcome {
        let defs = self.hooks.for_event(input.event());
        let mut rewritten: Option<String> = None;

        for def in defs {
            match def.hook_type {
                HookType::Prompt => {
                    if let Some(text) = &def.prompt {
                        debug!(event = %input.event(), "queueing prompt hook content");
                        self.queue.push(text.clone());
                    }
                }
                // Agent hooks currently execute like command hooks.
                HookType::Command | HookType::Agent => {
                    let Some(command) = &def.command else {
                        warn!(event = %input.event(), "command hook without a command; skipping");
                        continue;
                    };
                    match self
                        .run_command(command, &input, rewritten.as_deref(), cancel)
                        .await
                    {
                        CommandResult::Success { stdout } => {
                            if matches!(input, HookInput::UserPromptSubmit { .. })
                                && !stdout.trim().is_empty()
                            {
                                rewritten = Some(stdout.trim_end().to_string());
                            }
                        }
                        CommandResult::Failed { message } => {
                            if input.is_blocking() {
                                return HookOutcome::Blocked { message };
                            }
                            warn!(event = %input.event(), %message, "hook failed (non-blocking)");
                        }
                    }
                }
            }
        }

        match rewritten {
            Some(message) => HookOutcome::Replace(message),
            None => HookOutcome::Continue,
        }
    }

    async fn run_command(
        &self,
        command: &str,
        input: &HookInput<'_>,
        message_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> CommandResult {
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in input.env(message_override) {
            cmd.env(k, v);
        }

        debug!(event = %input.event(), hook = %command, "running command hook");
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CommandResult::Failed {
                    message: format!("hook spawn failed: {e}"),
                }
            }
        };

        let waited = tokio::select! {
            out = child.wait_with_output() => out,
            _ = cancel.cancelled() => {
                return CommandResult::Failed { message: "hook cancelled".into() };
            }
            _ = tokio::time::sleep(HOOK_TIMEOUT) => {
                return CommandResult::Failed {
                    message: format!("hook timed out after {}s", HOOK_TIMEOUT.as_secs()),
                };
            }
        };

        match waited {
            Ok(output) if output.status.success() => CommandResult::Success {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            },
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = output.status.code().unwrap_or(-1);
                CommandResult::Failed {
                    message: format!("hook exited {code}: {}", stderr.trim()),
                }
            }
            Err(e) => CommandResult::Failed {
                message: format!("hook wait failed: {e}"),
            },
        }
    }
}

enum CommandResult {
    Success { stdout: String },
    Failed { message: String },
}

fn truncate_env(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated]", &s[..end])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use knut_config::HookDef;
    use serde_json::json;

    fn command_hook(command: &str) -> HookDef {
        HookDef {
            hook_type: HookType::Command,
            command: Some(command.to_string()),
            prompt: None,
        }
    }

    fn prompt_hook(text: &str) -> HookDef {
        HookDef {
            hook_type: HookType::Prompt,
            command: None,
            prompt: Some(text.to_string()),
        }
    }

    fn runner_with(event: HookEvent, defs: Vec<HookDef>) -> HookRunner {
        let mut cfg = HooksConfig::default();
        match event {
            HookEvent::PreToolUse => cfg.pre_tool_use = defs,
            HookEvent::PostToolUse => cfg.post_tool_use = defs,
            HookEvent::UserPromptSubmit => cfg.user_prompt_submit = defs,
            HookEvent::SessionStart => cfg.session_start = defs,
            HookEvent::Stop => cfg.stop = defs,
            HookEvent::PermissionRequest => cfg.permission_request = defs,
        }
        HookRunner::new(cfg)
    }

    #[tokio::test]
    async fn no_hooks_continues() {
        let runner = HookRunner::new(HooksConfig::default());
        let out = runner
            .fire(HookInput::SessionStart, &CancellationToken::new())
            .await;
        assert_eq!(out, HookOutcome::Continue);
    }

    #[tokio::test]
    async fn pre_tool_use_nonzero_exit_blocks() {
        let runner = runner_with(
            HookEvent::PreToolUse,
            vec![command_hook("echo policy >&2; exit 1")],
        );
        let input = json!({"command": "rm -rf /"});
        let out = runner
            .fire(
                HookInput::PreToolUse {
                    tool_name: "Bash",
                    tool_input: &input,
                },
                &CancellationToken::new(),
            )
            .await;
        match out {
            HookOutcome::Blocked { message } => assert!(message.contains("policy")),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_tool_use_failure_short_circuits_later_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("ran");
        let runner = runner_with(
            HookEvent::PreToolUse,
            vec![
                command_hook("exit 1"),
                command_hook(&format!("touch {}", marker.display())),
            ],
        );
        let input = json!({});
        let out = runner
            .fire(
                HookInput::PreToolUse {
                    tool_name: "Bash",
                    tool_input: &input,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(out, HookOutcome::Blocked { .. }));
        assert!(!marker.exists(), "second hook must not have run");
    }

    #[tokio::test]
    async fn post_tool_use_failure_is_only_a_warning() {
        let runner = runner_with(HookEvent::PostToolUse, vec![command_hook("exit 3")]);
        let input = json!({});
        let out = runner
            .fire(
                HookInput::PostToolUse {
                    tool_name: "Bash",
                    tool_input: &input,
                    tool_output: "done",
                    is_error: false,
                },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out, HookOutcome::Continue);
    }

    #[tokio::test]
    async fn hook_sees_event_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let outfile = tmp.path().join("env.txt");
        let runner = runner_with(
            HookEvent::PreToolUse,
            vec![command_hook(&format!(
                "printf '%s %s %s' \"$HOOK_EVENT\" \"$TOOL_NAME\" \"$TOOL_INPUT\" > {}",
                outfile.display()
            ))],
        );
        let input = json!({"command": "ls"});
        runner
            .fire(
                HookInput::PreToolUse {
                    tool_name: "Bash",
                    tool_input: &input,
                },
                &CancellationToken::new(),
            )
            .await;
        let text = std::fs::read_to_string(&outfile).unwrap();
        assert!(text.starts_with("PreToolUse Bash"));
        assert!(text.contains("\"command\":\"ls\""));
    }

    #[tokio::test]
    async fn user_prompt_submit_stdout_replaces_message() {
        let runner = runner_with(
            HookEvent::UserPromptSubmit,
            vec![command_hook("echo \"rewritten: $USER_MESSAGE\"")],
        );
        let out = runner
            .fire(
                HookInput::UserPromptSubmit { message: "do X" },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out, HookOutcome::Replace("rewritten: do X".into()));
    }

    #[tokio::test]
    async fn user_prompt_submit_rewrites_chain() {
        let runner = runner_with(
            HookEvent::UserPromptSubmit,
            vec![
                command_hook("echo \"a($USER_MESSAGE)\""),
                command_hook("echo \"b($USER_MESSAGE)\""),
            ],
        );
        let out = runner
            .fire(
                HookInput::UserPromptSubmit { message: "x" },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out, HookOutcome::Replace("b(a(x))".into()));
    }

    #[tokio::test]
    async fn user_prompt_submit_empty_stdout_keeps_message() {
        let runner = runner_with(HookEvent::UserPromptSubmit, vec![command_hook("true")]);
        let out = runner
            .fire(
                HookInput::UserPromptSubmit { message: "unchanged" },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out, HookOutcome::Continue);
    }

    #[tokio::test]
    async fn prompt_hook_feeds_queue_not_outcome() {
        let runner = runner_with(
            HookEvent::PostToolUse,
            vec![prompt_hook("check the diff before committing")],
        );
        let input = json!({});
        let out = runner
            .fire(
                HookInput::PostToolUse {
                    tool_name: "FileEdit",
                    tool_input: &input,
                    tool_output: "ok",
                    is_error: false,
                },
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out, HookOutcome::Continue);
        let reminders = runner.queue().drain_as_reminders().unwrap();
        assert!(reminders.contains("check the diff"));
    }

    #[tokio::test]
    async fn cancelled_token_blocks_pre_hooks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = runner_with(HookEvent::PreToolUse, vec![command_hook("sleep 30")]);
        let input = json!({});
        let out = runner
            .fire(
                HookInput::PreToolUse {
                    tool_name: "Bash",
                    tool_input: &input,
                },
                &cancel,
            )
            .await;
        assert!(matches!(out, HookOutcome::Blocked { .. }));
    }

    #[test]
    fn tool_output_env_is_truncated() {
        let big = "y".repeat(TOOL_OUTPUT_ENV_LIMIT + 500);
        let t = truncate_env(&big, TOOL_OUTPUT_ENV_LIMIT);
        assert!(t.len() < big.len());
        assert!(t.ends_with("…[truncated]"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One layer of the on-disk `settings.json` format.
///
/// The same schema is used for every layer (managed, project, local, user);
/// layers are merged by [`crate::loader::load_settings`].  Unknown fields are
/// deliberately ignored rather than rejected so that older binaries keep
/// working against newer settings files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Model identifier forwarded to the API, e.g. "claude-sonnet-4-5".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Maximum tokens to request in a single completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Base URL override for the model API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    /// Extra environment variables applied to the process and to spawned
    /// tool/hook subprocesses.  Merged per key across layers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub permissions: PermissionsSettings,
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// Permission rule lists, serialized as rule strings (`Tool` or
/// `Tool(pattern)` — see [`crate::rules`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsSettings {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ask: Vec<String>,
}

/// Lifecycle events hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    SessionStart,
    Stop,
    PermissionRequest,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::SessionStart => "SessionStart",
            HookEvent::Stop => "Stop",
            HookEvent::PermissionRequest => "PermissionRequest",
        };
        write!(f, "{s}")
    }
}

/// Hook lists grouped by event kind, matching the settings-file keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default, rename = "PreToolUse", skip_serializing_if = "Vec::is_empty")]
    pub pre_tool_use: Vec<HookDef>,
    #[serde(default, rename = "PostToolUse", skip_serializing_if = "Vec::is_empty")]
    pub post_tool_use: Vec<HookDef>,
    #[serde(
        default,
        rename = "UserPromptSubmit",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub user_prompt_submit: Vec<HookDef>,
    #[serde(default, rename = "SessionStart", skip_serializing_if = "Vec::is_empty")]
    pub session_start: Vec<HookDef>,
    #[serde(default, rename = "Stop", skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<HookDef>,
    #[serde(
        default,
        rename = "PermissionRequest",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub permission_request: Vec<HookDef>,
}

impl HooksConfig {
    pub fn for_event(&self, event: HookEvent) -> &[HookDef] {
        match event {
            HookEvent::PreToolUse => &self.pre_tool_use,
            HookEvent::PostToolUse => &self.post_tool_use,
            HookEvent::UserPromptSubmit => &self.user_prompt_submit,
            HookEvent::SessionStart => &self.session_start,
            HookEvent::Stop => &self.stop,
            HookEvent::PermissionRequest => &self.permission_request,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pre_tool_use.is_empty()
            && self.post_tool_use.is_empty()
            && self.user_prompt_submit.is_empty()
            && self.session_start.is_empty()
            && self.stop.is_empty()
            && self.permission_request.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookType {
    /// Spawn a shell command; exit status decides block/continue.
    Command,
    /// Contribute text queued for injection into the model's next user turn.
    Prompt,
    /// Reserved for sub-agent hooks; currently executed like `Command`.
    Agent,
}

/// A single configured hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDef {
    #[serde(rename = "type")]
    pub hook_type: HookType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// One entry under `mcpServers` in `.mcp.json`.
///
/// `url` selects the SSE transport; otherwise `command`/`args` select stdio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl McpServerConfig {
    pub fn is_sse(&self) -> bool {
        self.url.is_some()
    }
}

/// Top-level shape of `.mcp.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpFile {
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_is_empty() {
        let s = Settings::default();
        assert!(s.model.is_none());
        assert!(s.env.is_empty());
        assert!(s.permissions.allow.is_empty());
        assert!(s.hooks.is_empty());
    }

    #[test]
    fn settings_deserialises_camel_case_keys() {
        let json = r#"{
            "model": "claude-sonnet-4-5",
            "maxOutputTokens": 8192,
            "apiBaseUrl": "https://proxy.internal",
            "env": { "FOO": "bar" }
        }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(s.max_output_tokens, Some(8192));
        assert_eq!(s.api_base_url.as_deref(), Some("https://proxy.internal"));
        assert_eq!(s.env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn settings_unknown_fields_are_ignored() {
        let json = r#"{ "model": "m", "someFutureKnob": { "a": 1 } }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.model.as_deref(), Some("m"));
    }

    #[test]
    fn permissions_lists_deserialise() {
        let json = r#"{ "permissions": { "allow": ["Bash(npm run *)"], "deny": ["WebFetch"] } }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.permissions.allow, vec!["Bash(npm run *)"]);
        assert_eq!(s.permissions.deny, vec!["WebFetch"]);
        assert!(s.permissions.ask.is_empty());
    }

    #[test]
    fn hooks_deserialise_by_event_key() {
        let json = r#"{
            "hooks": {
                "PreToolUse": [ { "type": "command", "command": "check.sh" } ],
                "UserPromptSubmit": [ { "type": "prompt", "prompt": "remember the style guide" } ]
            }
        }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.hooks.pre_tool_use.len(), 1);
        assert_eq!(s.hooks.pre_tool_use[0].hook_type, HookType::Command);
        assert_eq!(
            s.hooks.user_prompt_submit[0].prompt.as_deref(),
            Some("remember the style guide")
        );
        assert!(s.hooks.for_event(HookEvent::Stop).is_empty());
    }

    #[test]
    fn hook_event_display_matches_settings_keys() {
        assert_eq!(HookEvent::PreToolUse.to_string(), "PreToolUse");
        assert_eq!(HookEvent::UserPromptSubmit.to_string(), "UserPromptSubmit");
    }

    #[test]
    fn mcp_file_parses_stdio_and_sse_servers() {
        let json = r#"{
            "mcpServers": {
                "github": { "command": "gh-mcp", "args": ["--stdio"], "env": { "TOKEN": "x" } },
                "events": { "url": "https://mcp.example.com/sse" }
            }
        }"#;
        let f: McpFile = serde_json::from_str(json).unwrap();
        assert_eq!(f.mcp_servers.len(), 2);
        assert!(!f.mcp_servers["github"].is_sse());
        assert!(f.mcp_servers["events"].is_sse());
    }

    #[test]
    fn settings_round_trips_through_json() {
        let json = r#"{
            "model": "m",
            "permissions": { "allow": ["Bash(git status)"] },
            "hooks": { "Stop": [ { "type": "command", "command": "notify.sh" } ] }
        }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        let back: Settings = serde_json::from_str(&serde_json::to_string(&s).unwrap()).unwrap();
        assert_eq!(back.model.as_deref(), Some("m"));
        assert_eq!(back.permissions.allow, vec!["Bash(git status)"]);
        assert_eq!(back.hooks.stop.len(), 1);
    }
}

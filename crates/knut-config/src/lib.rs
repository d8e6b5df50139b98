// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod imports;
pub mod loader;
pub mod mode;
pub mod rules;
pub mod schema;
pub mod skills;

pub use loader::{config_dir, load_mcp_servers, load_settings, SettingsBundle};
pub use mode::PermissionMode;
pub use rules::{PermissionAction, PermissionRule, RuleSource, RuleSpec};
pub use schema::{HookDef, HookEvent, HookType, HooksConfig, McpServerConfig, Settings};
pub use skills::Skill;

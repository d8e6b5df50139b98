// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::rules::{parse_layer, PermissionAction, PermissionRule, RuleSource};
use crate::schema::{McpFile, McpServerConfig, Settings};

/// Resolve the configuration directory: `$CLAUDE_CONFIG_DIR` when set,
/// otherwise `~/.claude`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLAUDE_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(shellexpand::tilde(&dir).into_owned());
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

/// Merged view of all settings layers.
#[derive(Debug, Clone, Default)]
pub struct SettingsBundle {
    pub settings: Settings,
    /// Persisted permission rules in evaluation order:
    /// project → local → user → managed, deny before allow before ask
    /// within each layer.
    pub rules: Vec<PermissionRule>,
}

/// Settings layer paths from lowest to highest merge priority.
/// Later layers override earlier ones for scalar values.
fn layer_paths(config_dir: &Path, cwd: &Path) -> Vec<(PathBuf, RuleSource)> {
    vec![
        (config_dir.join("settings.json"), RuleSource::User),
        (cwd.join(".claude/settings.json"), RuleSource::Project),
        (cwd.join(".claude/settings.local.json"), RuleSource::Local),
        (
            PathBuf::from("/etc/claude/settings.json"),
            RuleSource::Managed,
        ),
    ]
}

/// Load and merge all settings layers.
///
/// Malformed layers are logged and skipped; a broken settings file must not
/// prevent startup.  Scalar values follow the merge priority
/// (managed > local > project > user), env maps merge per key, and
/// permission rules concatenate across layers in evaluation order.
pub fn load_settings(config_dir: &Path, cwd: &Path) -> SettingsBundle {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());
    let mut layers: HashMap<RuleSource, Settings> = HashMap::new();

    for (path, source) in layer_paths(config_dir, cwd) {
        let Some(value) = read_layer(&path) else {
            continue;
        };
        match serde_json::from_value::<Settings>(value.clone()) {
            Ok(s) => {
                layers.insert(source, s);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings layer has invalid shape; skipping");
                continue;
            }
        }
        merge_json(&mut merged, value);
    }

    let settings: Settings = serde_json::from_value(merged).unwrap_or_default();

    // Rule evaluation order: project → local → user → managed.
    let mut rules = Vec::new();
    for source in [
        RuleSource::Project,
        RuleSource::Local,
        RuleSource::User,
        RuleSource::Managed,
    ] {
        if let Some(layer) = layers.get(&source) {
            rules.extend(parse_layer(
                &layer.permissions.deny,
                PermissionAction::Deny,
                source,
            ));
            rules.extend(parse_layer(
                &layer.permissions.allow,
                PermissionAction::Allow,
                source,
            ));
            rules.extend(parse_layer(
                &layer.permissions.ask,
                PermissionAction::Ask,
                source,
            ));
        }
    }

    SettingsBundle { settings, rules }
}

fn read_layer(path: &Path) -> Option<serde_json::Value> {
    if !path.is_file() {
        return None;
    }
    debug!(path = %path.display(), "loading settings layer");
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read settings layer; skipping");
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "settings layer is not valid JSON; skipping");
            None
        }
    }
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.  Object
/// members merge recursively, which gives per-key env-map merging for free.
pub fn merge_json(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_json::Value::Object(serde_json::Map::new()));
                merge_json(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Load `.mcp.json` from the user home and the project directory.
/// Project entries override home entries per server name.
pub fn load_mcp_servers(cwd: &Path) -> HashMap<String, McpServerConfig> {
    let mut servers = HashMap::new();
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".mcp.json"));
    }
    paths.push(cwd.join(".mcp.json"));

    for path in paths {
        if !path.is_file() {
            continue;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read mcp config; skipping");
                continue;
            }
        };
        match serde_json::from_str::<McpFile>(&text) {
            Ok(file) => {
                debug!(path = %path.display(), servers = file.mcp_servers.len(), "loaded mcp config");
                servers.extend(file.mcp_servers);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "mcp config is not valid JSON; skipping");
            }
        }
    }
    servers
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_json::Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val(r#"{"x": 1}"#);
        merge_json(&mut dst, val(r#"{"x": 2}"#));
        assert_eq!(dst["x"], 2);
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val(r#"{"a": 1, "b": 2}"#);
        merge_json(&mut dst, val(r#"{"b": 99}"#));
        assert_eq!(dst["a"], 1);
        assert_eq!(dst["b"], 99);
    }

    #[test]
    fn merge_env_maps_per_key() {
        let mut dst = val(r#"{"env": {"A": "1", "B": "2"}}"#);
        merge_json(&mut dst, val(r#"{"env": {"B": "3", "C": "4"}}"#));
        assert_eq!(dst["env"]["A"], "1");
        assert_eq!(dst["env"]["B"], "3");
        assert_eq!(dst["env"]["C"], "4");
    }

    #[test]
    fn merge_is_associative_for_disjoint_scalars() {
        let a = val(r#"{"model": "m1"}"#);
        let b = val(r#"{"maxOutputTokens": 4096}"#);
        let c = val(r#"{"apiBaseUrl": "https://x"}"#);

        let mut left = a.clone();
        let mut bc = b.clone();
        merge_json(&mut bc, c.clone());
        merge_json(&mut left, bc);

        let mut right = a;
        merge_json(&mut right, b);
        merge_json(&mut right, c);

        assert_eq!(left, right);
    }

    #[test]
    fn load_settings_with_no_files_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = load_settings(&tmp.path().join("cfg"), tmp.path());
        assert!(bundle.settings.model.is_none());
        assert!(bundle.rules.is_empty());
    }

    #[test]
    fn project_scalar_overrides_user() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        std::fs::create_dir_all(&cfg).unwrap();
        std::fs::create_dir_all(tmp.path().join(".claude")).unwrap();
        std::fs::write(cfg.join("settings.json"), r#"{"model": "user-model"}"#).unwrap();
        std::fs::write(
            tmp.path().join(".claude/settings.json"),
            r#"{"model": "project-model"}"#,
        )
        .unwrap();

        let bundle = load_settings(&cfg, tmp.path());
        assert_eq!(bundle.settings.model.as_deref(), Some("project-model"));
    }

    #[test]
    fn rules_concatenate_project_before_user() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        std::fs::create_dir_all(&cfg).unwrap();
        std::fs::create_dir_all(tmp.path().join(".claude")).unwrap();
        std::fs::write(
            cfg.join("settings.json"),
            r#"{"permissions": {"allow": ["Grep"]}}"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join(".claude/settings.json"),
            r#"{"permissions": {"deny": ["Bash(rm *)"], "allow": ["Bash(ls *)"]}}"#,
        )
        .unwrap();

        let bundle = load_settings(&cfg, tmp.path());
        let order: Vec<(&str, PermissionAction, RuleSource)> = bundle
            .rules
            .iter()
            .map(|r| (r.tool.as_str(), r.action, r.source))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Bash", PermissionAction::Deny, RuleSource::Project),
                ("Bash", PermissionAction::Allow, RuleSource::Project),
                ("Grep", PermissionAction::Allow, RuleSource::User),
            ]
        );
    }

    #[test]
    fn malformed_layer_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        std::fs::create_dir_all(&cfg).unwrap();
        std::fs::write(cfg.join("settings.json"), "{ not json").unwrap();
        let bundle = load_settings(&cfg, tmp.path());
        assert!(bundle.settings.model.is_none());
    }

    #[test]
    fn mcp_project_overrides_home_per_server() {
        // Only the project path is exercised here; the home layer depends on
        // the real home directory and is covered by the extend() semantics.
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(".mcp.json"),
            r#"{"mcpServers": {"github": {"command": "gh-mcp"}}}"#,
        )
        .unwrap();
        let servers = load_mcp_servers(tmp.path());
        assert_eq!(servers["github"].command, "gh-mcp");
    }
}

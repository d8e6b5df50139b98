// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use regex::Regex;
use serde_json::Value;

use knut_config::PermissionRule;

/// Does `rule` match this call?  A rule matches when its tool equals the
/// call's tool and the pattern (when non-empty) matches the tool-specific
/// value extracted from the input.
pub fn rule_matches(rule: &PermissionRule, tool: &str, input: &Value, cwd: &Path) -> bool {
    if rule.tool != tool {
        return false;
    }
    if rule.pattern.is_empty() {
        return true;
    }
    match tool {
        "Bash" => bash_matches(&rule.pattern, str_arg(input, "command")),
        "FileRead" | "FileEdit" | "FileWrite" | "NotebookEdit" => {
            path_matches(&rule.pattern, str_arg(input, "file_path"), cwd)
        }
        "WebFetch" => url_matches(&rule.pattern, str_arg(input, "url")),
        "Glob" | "Grep" => glob_match(&rule.pattern, str_arg(input, "path")),
        // Unknown tools (including MCP wrappers) only match the empty
        // pattern; there is no defined extraction for their inputs.
        _ => false,
    }
}

fn str_arg<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Bash patterns accept three forms:
/// - glob (`npm run *`)
/// - `name:*` prefix (`npm:*` matches any `npm …`)
/// - whole-base-command prefix (`npm` matches `npm install`)
pub fn bash_matches(pattern: &str, command: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return command == prefix || command.starts_with(&format!("{prefix} "));
    }
    if has_glob_meta(pattern) {
        return glob_match(pattern, command);
    }
    // Literal pattern: exact command, or the pattern as whole-word prefix.
    command == pattern || command.starts_with(&format!("{pattern} "))
}

/// Doublestar glob on the absolute path and on the basename.  A relative
/// pattern also matches after anchoring at the session cwd.
pub fn path_matches(pattern: &str, file_path: &str, cwd: &Path) -> bool {
    if file_path.is_empty() {
        return false;
    }
    if glob_match(pattern, file_path) {
        return true;
    }
    let basename = Path::new(file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if glob_match(pattern, basename) {
        return true;
    }
    if !pattern.starts_with('/') {
        let anchored = cwd.join(pattern);
        if let Some(anchored) = anchored.to_str() {
            return glob_match(anchored, file_path);
        }
    }
    false
}

/// `domain:<host>` matches the URL's host exactly or as a parent domain;
/// any other pattern is a glob over the whole URL.
pub fn url_matches(pattern: &str, url: &str) -> bool {
    if let Some(host_pattern) = pattern.strip_prefix("domain:") {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        return host == host_pattern || host.ends_with(&format!(".{host_pattern}"));
    }
    glob_match(pattern, url)
}

fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Convert a doublestar glob to a regex and match the whole string.
/// `**` crosses `/` boundaries, `*` and `?` do not.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    match glob_to_regex(pattern) {
        Some(re) => re.is_match(value),
        None => false,
    }
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` may also match zero directories.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use serde_json::Value;

use knut_config::rules::{format, RuleSpec};

/// Commands whose first argument is a subcommand worth keeping in the
/// suggested pattern (`npm run *` rather than `npm *`).
const SUBCOMMAND_BASES: &[&str] = &["npm", "pnpm", "yarn", "bun", "cargo", "git", "make"];

/// Candidate rules the UI may offer to persist when a call needs asking.
/// At most three, most specific first.
pub fn suggestions(tool: &str, input: &Value) -> Vec<String> {
    let mut out = Vec::new();
    match tool {
        "Bash" => {
            if let Some(cmd) = input.get("command").and_then(Value::as_str) {
                if let Some(pattern) = bash_suggestion(cmd) {
                    out.push(rule(tool, &pattern));
                }
            }
        }
        "FileRead" | "FileEdit" | "FileWrite" | "NotebookEdit" => {
            if let Some(path) = input.get("file_path").and_then(Value::as_str) {
                if let Some(dir) = Path::new(path).parent().and_then(|p| p.to_str()) {
                    if !dir.is_empty() {
                        out.push(rule(tool, &format!("{dir}/**")));
                    }
                }
            }
        }
        "WebFetch" => {
            if let Some(url) = input.get("url").and_then(Value::as_str) {
                if let Some(host) = url::Url::parse(url).ok().and_then(|u| {
                    u.host_str().map(str::to_string)
                }) {
                    out.push(rule(tool, &format!("domain:{host}")));
                }
            }
        }
        _ => {}
    }
    out.truncate(3);
    out
}

/// The command's base-word pattern: `curl …` → `curl *`, `npm run test` →
/// `npm run *`.
fn bash_suggestion(command: &str) -> Option<String> {
    let mut words = command.split_whitespace();
    let base = words.next()?;
    if SUBCOMMAND_BASES.contains(&base) {
        if let Some(sub) = words.next() {
            if !sub.starts_with('-') {
                return Some(format_pattern(&[base, sub]));
            }
        }
    }
    Some(format_pattern(&[base]))
}

fn format_pattern(words: &[&str]) -> String {
    let mut s = words.join(" ");
    s.push_str(" *");
    s
}

fn rule(tool: &str, pattern: &str) -> String {
    format(&RuleSpec {
        tool: tool.to_string(),
        pattern: pattern.to_string(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Which settings layer (or the live session) a rule came from.
///
/// Evaluation order for persisted rules is project → local → user → managed;
/// session rules are checked before any persisted layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Session,
    Project,
    Local,
    User,
    Managed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// A parsed tool/pattern pair without action or provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub tool: String,
    /// Empty means "match any input for this tool".
    pub pattern: String,
}

/// A fully attributed permission rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    pub tool: String,
    pub pattern: String,
    pub action: PermissionAction,
    pub source: RuleSource,
}

impl PermissionRule {
    pub fn new(
        tool: impl Into<String>,
        pattern: impl Into<String>,
        action: PermissionAction,
        source: RuleSource,
    ) -> Self {
        Self {
            tool: tool.into(),
            pattern: pattern.into(),
            action,
            source,
        }
    }

    pub fn spec(&self) -> RuleSpec {
        RuleSpec {
            tool: self.tool.clone(),
            pattern: self.pattern.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("empty rule string")]
    Empty,
    #[error("invalid tool name in rule: {0:?}")]
    BadToolName(String),
    #[error("unterminated pattern in rule: {0:?}")]
    Unterminated(String),
    #[error("trailing characters after pattern in rule: {0:?}")]
    TrailingGarbage(String),
}

/// Parse a rule string of the form `ToolName` or `ToolName(pattern)`.
///
/// `(` and `)` inside the pattern are backslash-escaped.  `ToolName()` and
/// `ToolName(*)` both normalize to the empty pattern (match any), so the
/// canonical serialization of a match-any rule is the bare tool name.
pub fn parse(s: &str) -> Result<RuleSpec, RuleParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(RuleParseError::Empty);
    }

    let open = s.find('(');
    let tool = match open {
        Some(i) => &s[..i],
        None => s,
    };
    if tool.is_empty()
        || !tool
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RuleParseError::BadToolName(s.to_string()));
    }

    let Some(open) = open else {
        return Ok(RuleSpec {
            tool: tool.to_string(),
            pattern: String::new(),
        });
    };

    // Walk the pattern, honouring backslash escapes, until the closing paren.
    let mut pattern = String::new();
    let mut chars = s[open + 1..].char_indices();
    let mut closed_at: Option<usize> = None;
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, next @ ('(' | ')'))) => pattern.push(next),
                Some((_, next)) => {
                    pattern.push('\\');
                    pattern.push(next);
                }
                None => return Err(RuleParseError::Unterminated(s.to_string())),
            },
            ')' => {
                closed_at = Some(open + 1 + i);
                break;
            }
            _ => pattern.push(c),
        }
    }
    let Some(closed_at) = closed_at else {
        return Err(RuleParseError::Unterminated(s.to_string()));
    };
    if closed_at + 1 != s.len() {
        return Err(RuleParseError::TrailingGarbage(s.to_string()));
    }

    // Normalize the two match-any spellings.
    if pattern == "*" {
        pattern.clear();
    }

    Ok(RuleSpec {
        tool: tool.to_string(),
        pattern,
    })
}

/// Serialize a rule back to its canonical string form.
///
/// Inverse of [`parse`] for canonical inputs: `format(parse(s)) == s` for any
/// `s` already in canonical form, and `parse(format(r)) == r` for any rule.
pub fn format(spec: &RuleSpec) -> String {
    if spec.pattern.is_empty() {
        return spec.tool.clone();
    }
    let mut escaped = String::with_capacity(spec.pattern.len());
    for c in spec.pattern.chars() {
        if c == '(' || c == ')' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("{}({})", spec.tool, escaped)
}

/// Parse one layer's rule strings into attributed rules, skipping (and
/// logging) malformed entries — a bad rule must never take down startup.
pub fn parse_layer(
    strings: &[String],
    action: PermissionAction,
    source: RuleSource,
) -> Vec<PermissionRule> {
    strings
        .iter()
        .filter_map(|s| match parse(s) {
            Ok(spec) => Some(PermissionRule {
                tool: spec.tool,
                pattern: spec.pattern,
                action,
                source,
            }),
            Err(e) => {
                tracing::warn!(rule = %s, error = %e, "skipping malformed permission rule");
                None
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

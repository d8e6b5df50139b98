// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use knut_config::Skill;

/// Built-in system prompt core.
const BASE_PROMPT: &str = "You are a coding agent running in a user's terminal. \
You complete software tasks by calling the provided tools and reporting results concisely. \
Prefer tool calls over prose while working; answer directly when no tool is needed. \
Never invent file contents or command output — read and run things instead.";

/// Assemble the system prompt blocks for a session.
///
/// Block 1 is the stable prefix (base prompt + skills) and is the cacheable
/// portion; project instructions form a second block since they change per
/// working directory.
pub fn system_blocks(skills: &[Skill], project_instructions: Option<&str>) -> Vec<String> {
    let mut first = String::from(BASE_PROMPT);
    if !skills.is_empty() {
        first.push_str("\n\n# Skills\n");
        for skill in skills {
            first.push_str(&format!("\n## {}\n", skill.name));
            if !skill.description.is_empty() {
                first.push_str(&format!("{}\n", skill.description));
            }
            first.push_str(&skill.body);
            first.push('\n');
        }
    }

    let mut blocks = vec![first];
    if let Some(instructions) = project_instructions {
        if !instructions.trim().is_empty() {
            blocks.push(format!("# Project instructions\n\n{instructions}"));
        }
    }
    blocks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

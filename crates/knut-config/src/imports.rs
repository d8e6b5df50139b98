// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Project instruction files.
//!
//! `{cwd}/.claude/CLAUDE.md` plus `{cwd}/.claude/rules/*.md` are concatenated
//! into the system prompt.  Lines of the form `@relative/path.md` import the
//! referenced file inline.  Imports may nest; a visited-set of canonical
//! paths breaks cycles.  An `@path` that cannot be read stays in the output
//! as the literal line — a broken import is not an error.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Load all project instruction text for `cwd`, or `None` when the project
/// has no instruction files.
pub fn load_project_instructions(cwd: &Path) -> Option<String> {
    let dir = cwd.join(".claude");
    let mut sections = Vec::new();

    let main = dir.join("CLAUDE.md");
    if let Ok(text) = std::fs::read_to_string(&main) {
        let mut visited = HashSet::new();
        mark_visited(&mut visited, &main);
        sections.push(resolve_imports(&text, &dir, &mut visited));
    }

    let rules_dir = dir.join("rules");
    if let Ok(entries) = std::fs::read_dir(&rules_dir) {
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
            .collect();
        paths.sort();
        for path in paths {
            if let Ok(text) = std::fs::read_to_string(&path) {
                let mut visited = HashSet::new();
                mark_visited(&mut visited, &path);
                sections.push(resolve_imports(&text, &rules_dir, &mut visited));
            }
        }
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Expand `@path` import lines in `text`, reading paths relative to
/// `base_dir`.  `visited` carries the canonical paths already inlined on the
/// current import chain.
pub fn resolve_imports(text: &str, base_dir: &Path, visited: &mut HashSet<PathBuf>) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        match import_target(line) {
            Some(rel) => {
                let path = base_dir.join(rel);
                let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
                if visited.contains(&canonical) {
                    debug!(path = %path.display(), "import cycle detected; keeping literal line");
                    out.push_str(line);
                } else {
                    match std::fs::read_to_string(&path) {
                        Ok(imported) => {
                            visited.insert(canonical);
                            let parent = path.parent().unwrap_or(base_dir).to_path_buf();
                            out.push_str(&resolve_imports(&imported, &parent, visited));
                        }
                        // Unresolvable imports remain as literal lines.
                        Err(_) => out.push_str(line),
                    }
                }
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    // lines() drops the final terminator; keep output newline-normalized
    // without inventing a trailing newline the source did not have.
    if !text.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }
    out
}

/// Return the import path when `line` is an `@path` import line.
fn import_target(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix('@')?;
    // `@` followed by whitespace, or a bare `@`, is prose — not an import.
    if rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.contains(char::is_whitespace)
    {
        return None;
    }
    Some(rest)
}

fn mark_visited(visited: &mut HashSet<PathBuf>, path: &Path) {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    visited.insert(canonical);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let mut visited = HashSet::new();
        let out = resolve_imports("hello\nworld", tmp.path(), &mut visited);
        assert_eq!(out, "hello\nworld");
    }

    #[test]
    fn import_line_is_replaced_with_file_content() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("style.md"), "use tabs").unwrap();
        let mut visited = HashSet::new();
        let out = resolve_imports("before\n@style.md\nafter", tmp.path(), &mut visited);
        assert_eq!(out, "before\nuse tabs\nafter");
    }

    #[test]
    fn nested_imports_resolve_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "@b.md").unwrap();
        std::fs::write(tmp.path().join("b.md"), "leaf").unwrap();
        let mut visited = HashSet::new();
        let out = resolve_imports("@a.md", tmp.path(), &mut visited);
        assert_eq!(out, "leaf");
    }

    #[test]
    fn cyclic_imports_keep_literal_line() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "A\n@b.md").unwrap();
        std::fs::write(tmp.path().join("b.md"), "B\n@a.md").unwrap();
        let mut visited = HashSet::new();
        let out = resolve_imports("@a.md", tmp.path(), &mut visited);
        assert!(out.contains('A'));
        assert!(out.contains('B'));
        // The back-reference stays literal instead of recursing forever.
        assert!(out.contains("@a.md"));
    }

    #[test]
    fn missing_import_stays_literal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut visited = HashSet::new();
        let out = resolve_imports("@does-not-exist.md", tmp.path(), &mut visited);
        assert_eq!(out, "@does-not-exist.md");
    }

    #[test]
    fn email_like_text_is_not_an_import() {
        let tmp = tempfile::tempdir().unwrap();
        let mut visited = HashSet::new();
        let text = "mail me @ home\ncc @alice and @bob please";
        let out = resolve_imports(text, tmp.path(), &mut visited);
        assert_eq!(out, text);
    }

    #[test]
    fn load_project_instructions_reads_claude_md_and_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".claude");
        std::fs::create_dir_all(dir.join("rules")).unwrap();
        std::fs::write(dir.join("CLAUDE.md"), "main instructions").unwrap();
        std::fs::write(dir.join("rules/10-style.md"), "style rule").unwrap();
        std::fs::write(dir.join("rules/20-tests.md"), "test rule").unwrap();

        let text = load_project_instructions(tmp.path()).unwrap();
        assert!(text.contains("main instructions"));
        // rules/*.md are appended in sorted order
        let style = text.find("style rule").unwrap();
        let tests = text.find("test rule").unwrap();
        assert!(style < tests);
    }

    #[test]
    fn load_project_instructions_none_without_files() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_project_instructions(tmp.path()).is_none());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

/// A skill: a markdown document whose body is concatenated into the system
/// prompt, with YAML frontmatter carrying metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct SkillMeta {
    name: String,
    #[serde(default)]
    description: String,
}

/// Load skills from `{config_dir}/skills/*.md` and `{cwd}/.claude/skills/*.md`.
/// Project skills come last so a same-named project skill shadows the user one.
pub fn load_skills(config_dir: &Path, cwd: &Path) -> Vec<Skill> {
    let mut skills: Vec<Skill> = Vec::new();
    for dir in [config_dir.join("skills"), cwd.join(".claude/skills")] {
        for skill in load_dir(&dir) {
            skills.retain(|s| s.name != skill.name);
            skills.push(skill);
        }
    }
    skills
}

fn load_dir(dir: &Path) -> Vec<Skill> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
        .collect();
    paths.sort();

    let mut skills = Vec::new();
    for path in paths {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        match parse_skill(&text) {
            Some(skill) => skills.push(skill),
            None => {
                warn!(path = %path.display(), "skill file has no valid frontmatter; skipping")
            }
        }
    }
    skills
}

/// Split `---`-delimited YAML frontmatter from the markdown body.
pub fn parse_skill(text: &str) -> Option<Skill> {
    let rest = text.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');

    let meta: SkillMeta = serde_yaml::from_str(frontmatter).ok()?;
    Some(Skill {
        name: meta.name,
        description: meta.description,
        body: body.trim_end().to_string(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frontmatter_and_body() {
        let text = "---\nname: commit\ndescription: write a commit\n---\nAlways use imperative mood.";
        let s = parse_skill(text).unwrap();
        assert_eq!(s.name, "commit");
        assert_eq!(s.description, "write a commit");
        assert_eq!(s.body, "Always use imperative mood.");
    }

    #[test]
    fn description_is_optional() {
        let s = parse_skill("---\nname: terse\n---\nbody").unwrap();
        assert_eq!(s.description, "");
    }

    #[test]
    fn missing_frontmatter_is_rejected() {
        assert!(parse_skill("just a plain file").is_none());
        assert!(parse_skill("---\nname: x\nno terminator").is_none());
    }

    #[test]
    fn invalid_yaml_is_rejected() {
        assert!(parse_skill("---\n: [ not yaml\n---\nbody").is_none());
    }

    #[test]
    fn project_skill_shadows_user_skill_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        std::fs::create_dir_all(cfg.join("skills")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".claude/skills")).unwrap();
        std::fs::write(
            cfg.join("skills/deploy.md"),
            "---\nname: deploy\n---\nuser version",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join(".claude/skills/deploy.md"),
            "---\nname: deploy\n---\nproject version",
        )
        .unwrap();

        let skills = load_skills(&cfg, tmp.path());
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].body, "project version");
    }

    #[test]
    fn skills_load_from_both_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("cfg");
        std::fs::create_dir_all(cfg.join("skills")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".claude/skills")).unwrap();
        std::fs::write(cfg.join("skills/a.md"), "---\nname: a\n---\nA").unwrap();
        std::fs::write(
            tmp.path().join(".claude/skills/b.md"),
            "---\nname: b\n---\nB",
        )
        .unwrap();

        let skills = load_skills(&cfg, tmp.path());
        assert_eq!(skills.len(), 2);
    }
}

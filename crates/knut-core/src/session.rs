// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use knut_model::{ContentBlock, Message};

/// One conversation session.  History is owned by the loop and mutated only
/// from the loop task; everything else sees snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub model: String,
    pub cwd: PathBuf,
    pub history: Vec<Message>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(model: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.into(),
            cwd: cwd.into(),
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.history.push(message);
        self.updated_at = Utc::now();
    }

    /// Approximate token count of the whole history.
    pub fn approx_tokens(&self) -> usize {
        self.history.iter().map(Message::approx_tokens).sum()
    }

    /// Check the pairing invariant: every `ToolUse` in an assistant message
    /// is closed by exactly one `ToolResult` in a later user message before
    /// the next assistant message.
    pub fn history_is_closed(&self) -> bool {
        let mut open: Vec<String> = Vec::new();
        for message in &self.history {
            match message.role {
                knut_model::Role::Assistant => {
                    if !open.is_empty() {
                        return false;
                    }
                    for (id, _, _) in message.tool_uses() {
                        open.push(id.to_string());
                    }
                }
                knut_model::Role::User => {
                    for block in &message.content {
                        if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                            match open.iter().position(|id| id == tool_use_id) {
                                Some(pos) => {
                                    open.remove(pos);
                                }
                                None => return false,
                            }
                        }
                    }
                }
            }
        }
        open.is_empty()
    }
}

/// On-disk session persistence: one JSON file per session under
/// `{config_dir}/sessions/`.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            dir: config_dir.join("sessions"),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn save(&self, session: &Session) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let text = serde_json::to_string_pretty(session)?;
        std::fs::write(self.path(&session.id), text)?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> anyhow::Result<Session> {
        let text = std::fs::read_to_string(self.path(id))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The most recently saved session, by file modification time.
    pub fn most_recent(&self) -> Option<Session> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                        newest = Some((modified, path));
                    }
                }
            }
        }
        let (_, path) = newest?;
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AuthError;

/// Stored OAuth token set, `claudeAiOauth` member of the credentials file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch milliseconds.
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_tier: Option<String>,
}

impl OAuthTokens {
    /// True when `expires_at` is within `margin_ms` of now (or already past).
    pub fn expires_within(&self, margin_ms: u64) -> bool {
        let now = now_millis();
        self.expires_at <= now.saturating_add(margin_ms)
    }
}

/// The whole `.credentials.json` document.
///
/// `extra` captures every member this version does not model so that a save
/// after read-merge leaves unrelated fields untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_ai_oauth: Option<OAuthTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_account: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn credentials_path(config_dir: &Path) -> PathBuf {
    config_dir.join(".credentials.json")
}

pub fn lock_path(config_dir: &Path) -> PathBuf {
    config_dir.join(".credentials.lock")
}

/// Read the credentials file.  A missing file yields the empty document;
/// unreadable or malformed content is an error (callers must not clobber a
/// file they could not parse).
pub fn read(config_dir: &Path) -> Result<CredentialsFile, AuthError> {
    let path = credentials_path(config_dir);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CredentialsFile::default())
        }
        Err(e) => return Err(AuthError::Io(e)),
    };
    serde_json::from_str(&text)
        .map_err(|e| AuthError::Storage(format!("invalid {}: {e}", path.display())))
}

/// Apply `mutate` to the current on-disk document and rewrite the whole file.
///
/// The read happens immediately before the write so that concurrent writers
/// (guarded by the cross-process lock) always merge into the latest state.
/// File mode is 0600, containing directory 0700.
pub fn save_merged<F>(config_dir: &Path, mutate: F) -> Result<CredentialsFile, AuthError>
where
    F: FnOnce(&mut CredentialsFile),
{
    let mut doc = read(config_dir)?;
    mutate(&mut doc);
    write(config_dir, &doc)?;
    Ok(doc)
}

fn write(config_dir: &Path, doc: &CredentialsFile) -> Result<(), AuthError> {
    std::fs::create_dir_all(config_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700));
    }

    let path = credentials_path(config_dir);
    let text = serde_json::to_string_pretty(doc)
        .map_err(|e| AuthError::Storage(format!("serialize credentials: {e}")))?;
    std::fs::write(&path, text)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(access: &str, expires_at: u64) -> OAuthTokens {
        OAuthTokens {
            access_token: access.into(),
            refresh_token: "rt".into(),
            expires_at,
            scopes: vec!["user:inference".into()],
            subscription_type: Some("pro".into()),
            rate_limit_tier: None,
        }
    }

    #[test]
    fn missing_file_reads_as_empty_document() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = read(tmp.path()).unwrap();
        assert!(doc.claude_ai_oauth.is_none());
        assert!(doc.api_key.is_none());
    }

    #[test]
    fn malformed_file_is_an_error_not_a_clobber() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(credentials_path(tmp.path()), "{ nope").unwrap();
        assert!(read(tmp.path()).is_err());
    }

    #[test]
    fn save_and_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        save_merged(tmp.path(), |doc| {
            doc.claude_ai_oauth = Some(tokens("at-1", 42));
            doc.api_key = Some("sk-test".into());
        })
        .unwrap();
        let doc = read(tmp.path()).unwrap();
        assert_eq!(doc.claude_ai_oauth.unwrap().access_token, "at-1");
        assert_eq!(doc.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn save_preserves_unrelated_members() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            credentials_path(tmp.path()),
            r#"{"apiKey": "sk-old", "someVendorExtension": {"a": [1, 2]}}"#,
        )
        .unwrap();

        save_merged(tmp.path(), |doc| {
            doc.claude_ai_oauth = Some(tokens("at-new", 1));
        })
        .unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(credentials_path(tmp.path())).unwrap())
                .unwrap();
        assert_eq!(raw["apiKey"], "sk-old");
        assert_eq!(raw["someVendorExtension"]["a"][1], 2);
        assert_eq!(raw["claudeAiOauth"]["accessToken"], "at-new");
    }

    #[cfg(unix)]
    #[test]
    fn credentials_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        save_merged(tmp.path(), |doc| {
            doc.api_key = Some("sk".into());
        })
        .unwrap();
        let mode = std::fs::metadata(credentials_path(tmp.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn serialized_member_names_are_camel_case() {
        let doc = CredentialsFile {
            claude_ai_oauth: Some(tokens("a", 1)),
            oauth_account: Some(serde_json::json!({"emailAddress": "x@y.z"})),
            api_key: Some("k".into()),
            extra: Map::new(),
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"claudeAiOauth\""));
        assert!(json.contains("\"accessToken\""));
        assert!(json.contains("\"refreshToken\""));
        assert!(json.contains("\"expiresAt\""));
        assert!(json.contains("\"oauthAccount\""));
        assert!(json.contains("\"apiKey\""));
    }

    #[test]
    fn expires_within_margin() {
        let t = tokens("a", now_millis() + 60_000);
        assert!(t.expires_within(5 * 60 * 1000), "expires within 5 minutes");
        assert!(!t.expires_within(1_000), "not within 1 second");
    }
}

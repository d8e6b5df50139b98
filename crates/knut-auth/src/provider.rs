// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::credentials::{self, now_millis, OAuthTokens};
use crate::lock::CredentialsLock;
use crate::oauth::OAuthConfig;
use crate::AuthError;

/// Refresh when the access token expires within this window.
const REFRESH_MARGIN_MS: u64 = 5 * 60 * 1000;

/// A resolved outbound credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// OAuth access token, sent as `Authorization: Bearer`.
    Bearer(String),
    /// Plain API key, sent as `x-api-key`.
    ApiKey(String),
}

impl Credential {
    pub fn apply(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::Bearer(token) => rb.bearer_auth(token),
            Credential::ApiKey(key) => rb.header("x-api-key", key),
        }
    }
}

/// Resolves the credential for outbound API requests.
///
/// Priority at read time: `CLAUDE_CODE_OAUTH_TOKEN` env →
/// `CLAUDE_CODE_OAUTH_TOKEN_FILE_DESCRIPTOR` (read once, cached) →
/// `ANTHROPIC_API_KEY` → stored tokens, refreshing when close to expiry.
pub struct TokenProvider {
    config_dir: PathBuf,
    oauth: OAuthConfig,
    http: reqwest::Client,
    /// Token read from the inherited file descriptor; `None` until first
    /// resolution, then cached for the process lifetime (the FD is gone).
    fd_token: Mutex<Option<Option<String>>>,
    /// Serializes in-process refresh; the file lock covers other processes.
    refresh_gate: Mutex<()>,
    /// Set after a 401 to force one re-read/refresh on the next resolution.
    invalidated: std::sync::atomic::AtomicBool,
}

impl TokenProvider {
    pub fn new(config_dir: PathBuf, oauth: OAuthConfig) -> Self {
        Self {
            config_dir,
            oauth,
            http: reqwest::Client::new(),
            fd_token: Mutex::new(None),
            refresh_gate: Mutex::new(()),
            invalidated: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Mark the cached access token as rejected; the next
    /// [`TokenProvider::credential`] call refreshes before answering.
    pub fn invalidate(&self) {
        self.invalidated
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Resolve the current credential.
    pub async fn credential(&self) -> Result<Credential, AuthError> {
        if let Ok(token) = std::env::var("CLAUDE_CODE_OAUTH_TOKEN") {
            if !token.is_empty() {
                return Ok(Credential::Bearer(token));
            }
        }

        if let Some(token) = self.fd_token().await {
            return Ok(Credential::Bearer(token));
        }

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                return Ok(Credential::ApiKey(key));
            }
        }

        let doc = credentials::read(&self.config_dir)?;
        let Some(tokens) = doc.claude_ai_oauth else {
            // A stored standalone API key still counts as configured auth.
            if let Some(key) = doc.api_key {
                return Ok(Credential::ApiKey(key));
            }
            return Err(AuthError::NotConfigured);
        };

        let force = self
            .invalidated
            .swap(false, std::sync::atomic::Ordering::SeqCst);
        if force || tokens.expires_within(REFRESH_MARGIN_MS) {
            let refreshed = self.refresh(tokens).await?;
            return Ok(Credential::Bearer(refreshed.access_token));
        }
        Ok(Credential::Bearer(tokens.access_token))
    }

    /// Read the token from the inherited FD exactly once.
    async fn fd_token(&self) -> Option<String> {
        let mut cached = self.fd_token.lock().await;
        if let Some(value) = cached.as_ref() {
            return value.clone();
        }
        let value = read_fd_token();
        *cached = Some(value.clone());
        value
    }

    /// Refresh the stored tokens, coordinating with concurrent processes.
    ///
    /// Takes the in-process gate, then the cross-process file lock, then
    /// re-reads the credentials file: when another process already refreshed
    /// (the stored access token differs and is not near expiry), adopt its
    /// result instead of spending a second exchange.
    async fn refresh(&self, stale: OAuthTokens) -> Result<OAuthTokens, AuthError> {
        let _gate = self.refresh_gate.lock().await;
        let _lock = CredentialsLock::acquire(&self.config_dir).await?;

        let current = credentials::read(&self.config_dir)?
            .claude_ai_oauth
            .unwrap_or_else(|| stale.clone());
        if current.access_token != stale.access_token && !current.expires_within(REFRESH_MARGIN_MS)
        {
            debug!("another process refreshed the tokens; adopting");
            return Ok(current);
        }

        debug!("refreshing oauth tokens");
        let resp = self
            .http
            .post(self.oauth.token_url())
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "client_id": self.oauth.client_id,
                "refresh_token": current.refresh_token,
            }))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED
            || resp.status() == reqwest::StatusCode::FORBIDDEN
        {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(format!("token refresh: {body}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Flow(format!(
                "token refresh failed ({status}): {body}"
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
            expires_in: u64,
        }
        let tr: TokenResponse = resp.json().await?;

        // Best-effort profile refetch keeps subscription metadata current;
        // when it fails, the previously stored values survive.
        let profile = self.oauth.fetch_profile(&self.http, &tr.access_token).await;
        if profile.is_none() {
            warn!("profile fetch after refresh failed; keeping stored subscription metadata");
        }

        let fresh = OAuthTokens {
            access_token: tr.access_token,
            refresh_token: tr.refresh_token,
            expires_at: now_millis() + tr.expires_in * 1000,
            scopes: current.scopes.clone(),
            subscription_type: profile
                .as_ref()
                .and_then(|p| p.subscription_type.clone())
                .or(current.subscription_type.clone()),
            rate_limit_tier: profile
                .as_ref()
                .and_then(|p| p.rate_limit_tier.clone())
                .or(current.rate_limit_tier.clone()),
        };

        let saved = fresh.clone();
        credentials::save_merged(&self.config_dir, move |doc| {
            doc.claude_ai_oauth = Some(saved);
        })?;
        Ok(fresh)
    }
}

/// Read a bearer token from the FD named by
/// `CLAUDE_CODE_OAUTH_TOKEN_FILE_DESCRIPTOR`.  The descriptor is consumed:
/// this can only ever work once per process, hence the provider-level cache.
fn read_fd_token() -> Option<String> {
    let raw = std::env::var("CLAUDE_CODE_OAUTH_TOKEN_FILE_DESCRIPTOR").ok()?;
    let fd: i32 = raw.trim().parse().ok()?;
    #[cfg(unix)]
    {
        use std::io::Read;
        use std::os::unix::io::FromRawFd;
        // Safety: the parent handed us this FD for exactly this purpose; we
        // take ownership and close it after the single read.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut token = String::new();
        file.read_to_string(&mut token).ok()?;
        let token = token.trim().to_string();
        (!token.is_empty()).then_some(token)
    }
    #[cfg(not(unix))]
    {
        let _ = fd;
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

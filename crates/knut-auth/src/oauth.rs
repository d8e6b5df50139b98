// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Interactive OAuth PKCE login.
//!
//! The flow opens the system browser on the authorization URL with a
//! loopback `redirect_uri`, while also printing a manual URL whose redirect
//! target is a fixed console page.  Whichever arrives first wins: the
//! loopback callback, or a `code#state` string pasted on stdin.  After the
//! code exchange the flow fetches the account profile, roles, and a newly
//! issued API key — each best-effort; a failure there never fails login.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, warn};
use url::Url;

use crate::credentials::{self, now_millis, OAuthTokens};
use crate::pkce;
use crate::AuthError;

const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const DEFAULT_AUTHORIZE_BASE: &str = "https://claude.ai";
const DEFAULT_API_BASE: &str = "https://console.anthropic.com";
const OAUTH_SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Origins a `CLAUDE_CODE_CUSTOM_OAUTH_URL` override may point at.
/// Anything else is refused outright.
const APPROVED_ENDPOINTS: &[&str] = &[
    "https://claude.ai",
    "https://console.anthropic.com",
    "https://api.anthropic.com",
];

/// Resolved OAuth endpoint set.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_base: String,
    pub api_base: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.into(),
            authorize_base: DEFAULT_AUTHORIZE_BASE.into(),
            api_base: DEFAULT_API_BASE.into(),
        }
    }
}

impl OAuthConfig {
    /// Build the config from the environment.
    ///
    /// `CLAUDE_CODE_OAUTH_CLIENT_ID` overrides the client id;
    /// `CLAUDE_CODE_CUSTOM_OAUTH_URL` repoints both endpoint bases and must
    /// be in the static allowlist.
    pub fn from_env() -> Result<Self, AuthError> {
        let mut cfg = Self::default();
        if let Ok(id) = std::env::var("CLAUDE_CODE_OAUTH_CLIENT_ID") {
            if !id.is_empty() {
                cfg.client_id = id;
            }
        }
        if let Ok(base) = std::env::var("CLAUDE_CODE_CUSTOM_OAUTH_URL") {
            if !base.is_empty() {
                let base = base.trim_end_matches('/').to_string();
                if !is_approved_endpoint(&base) {
                    return Err(AuthError::Flow(format!(
                        "custom oauth URL {base:?} is not an approved endpoint"
                    )));
                }
                cfg.authorize_base = base.clone();
                cfg.api_base = base;
            }
        }
        Ok(cfg)
    }

    pub fn token_url(&self) -> String {
        format!("{}/v1/oauth/token", self.api_base)
    }

    fn authorize_url(&self) -> String {
        format!("{}/oauth/authorize", self.authorize_base)
    }

    /// Fixed console page used as `redirect_uri` for the manual flow.
    fn manual_redirect_uri(&self) -> String {
        format!("{}/oauth/code/callback", self.api_base)
    }

    /// Best-effort profile fetch; `None` on any failure.
    pub async fn fetch_profile(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Option<Profile> {
        let resp = http
            .get(format!("{}/api/oauth/profile", self.api_base))
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: Value = resp.json().await.ok()?;
        Some(Profile {
            subscription_type: body
                .pointer("/account/subscriptionType")
                .or_else(|| body.get("subscriptionType"))
                .and_then(Value::as_str)
                .map(str::to_string),
            rate_limit_tier: body
                .get("rateLimitTier")
                .and_then(Value::as_str)
                .map(str::to_string),
            account: body.get("account").cloned().or(Some(body)),
        })
    }
}

/// Subset of the profile response the host stores.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub subscription_type: Option<String>,
    pub rate_limit_tier: Option<String>,
    pub account: Option<Value>,
}

pub fn is_approved_endpoint(base: &str) -> bool {
    APPROVED_ENDPOINTS.contains(&base)
}

/// The interactive login flow.
pub struct LoginFlow {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl LoginFlow {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Run the full login and persist the result under `config_dir`.
    pub async fn run(&self, config_dir: &Path) -> Result<(), AuthError> {
        let challenge = pkce::generate();
        let state = pkce::state();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let loopback_redirect = format!("http://localhost:{port}/callback");

        let browser_url = self.build_authorize_url(&challenge.challenge, &state, &loopback_redirect);
        let manual_url = self.build_authorize_url(
            &challenge.challenge,
            &state,
            &self.config.manual_redirect_uri(),
        );

        eprintln!("Opening browser for login…");
        eprintln!("If the browser does not open, visit:\n\n  {manual_url}\n");
        eprintln!("then paste the code shown (code#state) and press Enter.");
        if webbrowser::open(&browser_url).is_err() {
            warn!("could not open browser; falling back to manual paste");
        }

        // Race the loopback callback against a pasted code.
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let code = tokio::select! {
            cb = wait_for_callback(&listener, &state) => cb?,
            line = stdin.next_line() => {
                let line = line?.unwrap_or_default();
                parse_pasted_code(&line, &state)?
            }
        };

        let tokens = self.exchange_code(&code, &challenge.verifier, &state, &loopback_redirect)
            .await?;

        // Best-effort enrichment; failures are logged, never fatal.
        let profile = self.config.fetch_profile(&self.http, &tokens.access_token).await;
        if profile.is_none() {
            warn!("profile fetch failed; continuing without account metadata");
        }
        let roles = self.fetch_roles(&tokens.access_token).await;
        if roles.is_none() {
            debug!("roles fetch failed or empty");
        }
        let api_key = self.create_api_key(&tokens.access_token).await;
        if api_key.is_none() {
            warn!("API key issuance failed; continuing with OAuth tokens only");
        }

        let OAuthTokens {
            access_token,
            refresh_token,
            expires_at,
            scopes,
            subscription_type,
            rate_limit_tier,
        } = tokens;
        let stored = OAuthTokens {
            access_token,
            refresh_token,
            expires_at,
            scopes,
            subscription_type: profile
                .as_ref()
                .and_then(|p| p.subscription_type.clone())
                .or(subscription_type),
            rate_limit_tier: profile
                .as_ref()
                .and_then(|p| p.rate_limit_tier.clone())
                .or(rate_limit_tier),
        };
        let account = profile.and_then(|p| p.account).map(|mut acct| {
            if let (Some(obj), Some(r)) = (acct.as_object_mut(), roles) {
                obj.insert("roles".into(), r);
            }
            acct
        });

        credentials::save_merged(config_dir, move |doc| {
            doc.claude_ai_oauth = Some(stored);
            if account.is_some() {
                doc.oauth_account = account;
            }
            if api_key.is_some() {
                doc.api_key = api_key;
            }
        })?;

        eprintln!("Login successful.");
        Ok(())
    }

    fn build_authorize_url(&self, challenge: &str, state: &str, redirect_uri: &str) -> String {
        let mut url = Url::parse(&self.config.authorize_url()).expect("static authorize URL");
        url.query_pairs_mut()
            .append_pair("code", "true")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", OAUTH_SCOPES)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        url.to_string()
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        state: &str,
        redirect_uri: &str,
    ) -> Result<OAuthTokens, AuthError> {
        let resp = self
            .http
            .post(self.config.token_url())
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "code": code,
                "state": state,
                "client_id": self.config.client_id,
                "redirect_uri": redirect_uri,
                "code_verifier": verifier,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(format!(
                "code exchange failed ({status}): {body}"
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
            expires_in: u64,
            #[serde(default)]
            scope: Option<String>,
        }
        let tr: TokenResponse = resp.json().await?;
        Ok(OAuthTokens {
            access_token: tr.access_token,
            refresh_token: tr.refresh_token,
            expires_at: now_millis() + tr.expires_in * 1000,
            scopes: tr
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            subscription_type: None,
            rate_limit_tier: None,
        })
    }

    async fn fetch_roles(&self, access_token: &str) -> Option<Value> {
        let resp = self
            .http
            .get(format!(
                "{}/api/oauth/claude_cli/roles",
                self.config.api_base
            ))
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        resp.status().is_success().then_some(())?;
        resp.json().await.ok()
    }

    async fn create_api_key(&self, access_token: &str) -> Option<String> {
        let resp = self
            .http
            .post(format!(
                "{}/api/oauth/claude_cli/create_api_key",
                self.config.api_base
            ))
            .bearer_auth(access_token)
            .send()
            .await
            .ok()?;
        resp.status().is_success().then_some(())?;
        let body: Value = resp.json().await.ok()?;
        body.get("raw_key")
            .or_else(|| body.get("key"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Accept one loopback connection and extract `code`, validating `state`.
async fn wait_for_callback(listener: &TcpListener, expected_state: &str) -> Result<String, AuthError> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        let Some(path) = request_path(&request) else {
            respond(&mut stream, 400, "Bad request").await;
            continue;
        };
        // Browsers also ask for /favicon.ico; only the callback counts.
        if !path.starts_with("/callback") {
            respond(&mut stream, 404, "Not found").await;
            continue;
        }

        match parse_callback_query(&path, expected_state) {
            Ok(code) => {
                respond(
                    &mut stream,
                    200,
                    "Login complete. You can close this tab and return to the terminal.",
                )
                .await;
                return Ok(code);
            }
            Err(e) => {
                respond(&mut stream, 400, "Login failed; check the terminal.").await;
                return Err(e);
            }
        }
    }
}

fn request_path(request: &str) -> Option<String> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    (method == "GET").then(|| path.to_string())
}

/// Extract and validate `code`/`state` from a callback path.
pub fn parse_callback_query(path: &str, expected_state: &str) -> Result<String, AuthError> {
    let url = Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| AuthError::Flow(format!("bad callback path: {e}")))?;
    let mut code = None;
    let mut state = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => return Err(AuthError::Flow(format!("authorization denied: {v}"))),
            _ => {}
        }
    }
    let code = code.ok_or_else(|| AuthError::Flow("callback missing code".into()))?;
    if state.as_deref() != Some(expected_state) {
        return Err(AuthError::Flow("state mismatch in callback".into()));
    }
    Ok(code)
}

/// Parse a manually pasted `code#state` string, validating the state half.
pub fn parse_pasted_code(input: &str, expected_state: &str) -> Result<String, AuthError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AuthError::Flow("empty code input".into()));
    }
    match input.split_once('#') {
        Some((code, state)) => {
            if state != expected_state {
                return Err(AuthError::Flow("state mismatch in pasted code".into()));
            }
            Ok(code.to_string())
        }
        // A bare code without the state suffix cannot be validated.
        None => Err(AuthError::Flow(
            "expected code#state format; paste the full string from the browser".into(),
        )),
    }
}

async fn respond(stream: &mut tokio::net::TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Bad Request",
    };
    let page = format!(
        "<html><body style=\"font-family: sans-serif; margin: 4em\"><p>{body}</p></body></html>"
    );
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{page}",
        page.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

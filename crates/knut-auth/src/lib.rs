// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `knut-auth` — credential handling for the agent host.
//!
//! Three layers:
//!
//! - [`pkce`] generates the RFC 7636 verifier/challenge pair and the opaque
//!   `state` parameter.
//! - [`credentials`] owns the on-disk `.credentials.json` file: typed members
//!   for the OAuth tokens, account metadata, and API key, plus a
//!   read-merge-rewrite save path that preserves fields this version does not
//!   know about.
//! - [`provider`] resolves the bearer credential at request time (env var →
//!   inherited file descriptor → stored tokens) and refreshes stored tokens
//!   behind both an in-process mutex and a cross-process file lock so that
//!   concurrent hosts perform exactly one token exchange.
//!
//! [`oauth`] drives the interactive PKCE login: loopback callback, manual
//! paste fallback, token exchange, and best-effort profile/roles/API-key
//! fetch.

pub mod credentials;
pub mod lock;
pub mod oauth;
pub mod pkce;
pub mod provider;

pub use credentials::{CredentialsFile, OAuthTokens};
pub use oauth::{LoginFlow, OAuthConfig};
pub use provider::{Credential, TokenProvider};

/// Third-party model provider declared via the environment, if any.
///
/// When one of these is set, auth status is reported against that provider's
/// own credential chain instead of prompting for a first-party login.
pub fn third_party_provider() -> Option<&'static str> {
    let declared = |var: &str| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false);
    if declared("CLAUDE_CODE_USE_BEDROCK") {
        Some("bedrock")
    } else if declared("CLAUDE_CODE_USE_VERTEX") {
        Some("vertex")
    } else if declared("CLAUDE_CODE_USE_FOUNDRY") {
        Some("foundry")
    } else {
        None
    }
}

/// Errors surfaced by credential resolution.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No token available anywhere; fatal for any model call.
    #[error("no credentials configured; run `knut --login` or set ANTHROPIC_API_KEY")]
    NotConfigured,
    /// The API or token endpoint rejected our credential.
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("credential storage error: {0}")]
    Storage(String),
    #[error("oauth flow error: {0}")]
    Flow(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

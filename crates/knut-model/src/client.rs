// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use knut_auth::{Credential, TokenProvider};

use crate::wire::{build_request_body, parse_stream_event};
use crate::{CompletionRequest, EventStream, ModelProvider};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Beta flag required when authenticating with an OAuth bearer token.
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Streaming messages-API client.
///
/// Transient transport failures (connect errors, timeouts, 429, 5xx) are
/// retried with exponential backoff and jitter up to `max_retries` attempts.
/// A 401 invalidates the cached access token and retries exactly once.
pub struct ApiClient {
    model: String,
    base_url: String,
    tokens: Arc<TokenProvider>,
    max_retries: u32,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(model: String, base_url: Option<String>, tokens: Arc<TokenProvider>) -> Self {
        Self {
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            tokens,
            max_retries: 3,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn send_once(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let credential = self.tokens.credential().await?;
        let mut rb = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION);
        if matches!(credential, Credential::Bearer(_)) {
            rb = rb.header("anthropic-beta", OAUTH_BETA);
        }
        let resp = credential
            .apply(rb)
            .json(body)
            .send()
            .await
            .context("model request failed")?;
        Ok(resp)
    }

    /// Send with the retry policy applied; returns a successful response.
    async fn send_with_retries(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut auth_retried = false;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.send_once(body).await;
            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    self.backoff(attempt, &format!("{e:#}")).await;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            if status == reqwest::StatusCode::UNAUTHORIZED && !auth_retried {
                // The cached access token was rejected; drop it and retry
                // once with a freshly resolved credential.
                auth_retried = true;
                warn!("model API returned 401; invalidating cached token and retrying");
                self.tokens.invalidate();
                continue;
            }
            let retryable = status.is_server_error()
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            let text = resp.text().await.unwrap_or_default();
            if retryable && attempt < self.max_retries {
                self.backoff(attempt, &format!("{status}")).await;
                continue;
            }
            bail!("model API error {status}: {text}");
        }
    }

    async fn backoff(&self, attempt: u32, reason: &str) {
        let base_ms = 500u64.saturating_mul(1 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
        let delay = Duration::from_millis(base_ms + jitter);
        warn!(attempt, ?delay, reason, "retrying model request");
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl ModelProvider for ApiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let mut req = req;
        if req.model.is_empty() {
            req.model = self.model.clone();
        }
        let body = build_request_body(&req);
        debug!(model = %req.model, messages = req.messages.len(), tools = req.tools.len(),
               "sending model request");

        let resp = self.send_with_retries(&body).await?;
        let byte_stream = resp.bytes_stream();

        // SSE lines can split across TCP chunks; carry the remainder forward
        // and only parse complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            if let Some(ev) = parse_stream_event(&v) {
                                events.push(Ok(ev));
                            }
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

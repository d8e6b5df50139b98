// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::{self, Incoming, RpcError};
use crate::transport::Transport;
use crate::McpError;

/// How long to wait for the server's `event: endpoint` frame.
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// HTTP+SSE transport.
///
/// A long-lived `GET` carries server-to-client traffic; the first
/// `event: endpoint` frame names the URL requests are `POST`ed to.
/// Responses arrive either inline (`application/json`) or on the event
/// stream as `event: message` frames, demuxed by request id.
pub struct SseTransport {
    server_name: String,
    http: reqwest::Client,
    endpoint: String,
    pending: PendingMap,
    cancel: CancellationToken,
}

impl SseTransport {
    pub async fn connect(server_name: &str, url: &str) -> Result<Self, McpError> {
        let base = Url::parse(url).map_err(|e| McpError::Transport(format!("bad url: {e}")))?;
        let http = reqwest::Client::new();

        let resp = http
            .get(url)
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "event stream request failed with {}",
                resp.status()
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<String, McpError>>();

        {
            let pending = Arc::clone(&pending);
            let cancel = cancel.clone();
            let name = server_name.to_string();
            let mut endpoint_tx = Some(endpoint_tx);
            tokio::spawn(async move {
                let mut stream = resp.bytes_stream();
                let mut buf = String::new();
                let mut current = FrameAccumulator::default();
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => break,
                        chunk = stream.next() => chunk,
                    };
                    let Some(chunk) = chunk else { break };
                    let text = match chunk {
                        Ok(b) => String::from_utf8_lossy(&b).to_string(),
                        Err(e) => {
                            warn!(server = %name, error = %e, "sse stream error");
                            break;
                        }
                    };
                    buf.push_str(&text);
                    for frame in drain_frames(&mut buf, &mut current) {
                        match frame.event.as_str() {
                            "endpoint" => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let resolved = resolve_endpoint(&base, &frame.data);
                                    let _ = tx.send(resolved);
                                }
                            }
                            "message" | "" => {
                                let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                                    warn!(server = %name, "sse message frame is not JSON");
                                    continue;
                                };
                                dispatch(&name, &pending, value);
                            }
                            other => {
                                debug!(server = %name, event = other, "ignoring sse event");
                            }
                        }
                    }
                }
                // Stream ended: fail in-flight requests.
                let mut pending = pending.lock().unwrap();
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(RpcError {
                        code: -1,
                        message: "event stream closed".into(),
                        data: None,
                    }));
                }
            });
        }

        let endpoint = tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx)
            .await
            .map_err(|_| McpError::Transport("no endpoint event from server".into()))?
            .map_err(|_| McpError::Transport("event stream closed before endpoint".into()))??;

        debug!(server = server_name, %endpoint, "sse transport connected");
        Ok(Self {
            server_name: server_name.to_string(),
            http,
            endpoint,
            pending,
            cancel,
        })
    }
}

fn dispatch(name: &str, pending: &PendingMap, value: Value) {
    match protocol::parse_incoming(value) {
        Some(Incoming::Response { id, result }) => {
            let slot = pending.lock().unwrap().remove(&id);
            match slot {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => warn!(server = %name, id, "sse response for unknown request id"),
            }
        }
        Some(Incoming::Notification { method, .. }) => {
            debug!(server = %name, %method, "mcp notification");
        }
        None => {}
    }
}

/// The `endpoint` frame's data is an absolute URL or a base-relative path.
pub(crate) fn resolve_endpoint(base: &Url, data: &str) -> Result<String, McpError> {
    let data = data.trim();
    if data.is_empty() {
        return Err(McpError::Protocol("empty endpoint event".into()));
    }
    base.join(data)
        .map(|u| u.to_string())
        .map_err(|e| McpError::Protocol(format!("bad endpoint url {data:?}: {e}")))
}

#[derive(Default)]
pub(crate) struct FrameAccumulator {
    event: String,
    data: Vec<String>,
}

/// Cut completed SSE frames out of `buf`.  A frame ends at a blank line;
/// incomplete trailing lines stay in the buffer for the next chunk.
pub(crate) fn drain_frames(buf: &mut String, current: &mut FrameAccumulator) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        buf.drain(..=pos);
        if line.is_empty() {
            if !current.data.is_empty() || !current.event.is_empty() {
                frames.push(SseFrame {
                    event: std::mem::take(&mut current.event),
                    data: std::mem::take(&mut current.data).join("\n"),
                });
            }
            continue;
        }
        if let Some(event) = line.strip_prefix("event:") {
            current.event = event.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            current.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // Comments (`:`) and other fields are ignored.
    }
    frames
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, id: u64, method: &str, params: Value) -> Result<Value, McpError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let body = protocol::request(id, method, params);
        let resp = match self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(e.into());
            }
        };

        if !resp.status().is_success() {
            self.pending.lock().unwrap().remove(&id);
            return Err(McpError::Transport(format!(
                "request failed with {}",
                resp.status()
            )));
        }

        // Inline JSON responses resolve immediately; otherwise the answer
        // arrives on the event stream and lands in our pending slot.
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if content_type.contains("application/json") {
            let value: Value = resp.json().await?;
            self.pending.lock().unwrap().remove(&id);
            return match protocol::parse_incoming(value) {
                Some(Incoming::Response { result, .. }) => result.map_err(Into::into),
                _ => Err(McpError::Protocol("response is not a JSON-RPC reply".into())),
            };
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rpc)) => Err(rpc.into()),
            Err(_) => Err(McpError::Transport(format!(
                "{}: event stream closed before reply",
                self.server_name
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let body = protocol::notification(method, params);
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::ACCEPTED {
            return Err(McpError::Transport(format!(
                "notification failed with {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Cancels the event-stream reader; in-flight calls fail promptly.
    async fn close(&self) {
        self.cancel.cancel();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(chunks: &[&str]) -> Vec<SseFrame> {
        let mut buf = String::new();
        let mut acc = FrameAccumulator::default();
        let mut frames = Vec::new();
        for chunk in chunks {
            buf.push_str(chunk);
            frames.extend(drain_frames(&mut buf, &mut acc));
        }
        frames
    }

    #[test]
    fn endpoint_frame_parses() {
        let frames = feed(&["event: endpoint\ndata: /messages?sid=42\n\n"]);
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "endpoint".into(),
                data: "/messages?sid=42".into()
            }]
        );
    }

    #[test]
    fn frames_split_across_chunks_reassemble() {
        let frames = feed(&["event: mess", "age\ndata: {\"jsonrpc\"", ":\"2.0\"}\n", "\n"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let frames = feed(&["data: line1\ndata: line2\n\n"]);
        assert_eq!(frames[0].data, "line1\nline2");
        assert_eq!(frames[0].event, "");
    }

    #[test]
    fn crlf_lines_are_handled() {
        let frames = feed(&["event: message\r\ndata: {}\r\n\r\n"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn incomplete_frame_stays_buffered() {
        let mut buf = String::from("event: message\ndata: partial");
        let mut acc = FrameAccumulator::default();
        assert!(drain_frames(&mut buf, &mut acc).is_empty());
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn endpoint_resolution_absolute_and_relative() {
        let base = Url::parse("https://mcp.example.com/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "/messages?sid=1").unwrap(),
            "https://mcp.example.com/messages?sid=1"
        );
        assert_eq!(
            resolve_endpoint(&base, "https://other.example.com/rpc").unwrap(),
            "https://other.example.com/rpc"
        );
        assert!(resolve_endpoint(&base, "").is_err());
    }
}

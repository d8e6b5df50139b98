// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::PROTOCOL_VERSION;
use crate::transport::Transport;
use crate::McpError;

/// A tool discovered on a remote server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// JSON-RPC client for one MCP server.
pub struct McpClient {
    pub server_name: String,
    transport: Box<dyn Transport>,
    next_id: AtomicU64,
    capabilities: Mutex<Value>,
    server_info: Mutex<Value>,
}

impl McpClient {
    pub fn new(server_name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            server_name: server_name.into(),
            transport,
            next_id: AtomicU64::new(1),
            capabilities: Mutex::new(Value::Null),
            server_info: Mutex::new(Value::Null),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Negotiated server capabilities, recorded by [`McpClient::initialize`].
    pub fn capabilities(&self) -> Value {
        self.capabilities.lock().unwrap().clone()
    }

    pub fn server_info(&self) -> Value {
        self.server_info.lock().unwrap().clone()
    }

    /// One request, racing the caller's cancellation token.
    async fn request(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        let id = self.allocate_id();
        debug!(server = %self.server_name, %method, id, "mcp request");
        tokio::select! {
            _ = cancel.cancelled() => Err(McpError::Cancelled),
            result = self.transport.request(id, method, params) => result,
        }
    }

    /// `initialize` followed by the mandatory `notifications/initialized`.
    /// Must complete before any other call.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {}, "resources": {} },
            "clientInfo": {
                "name": "knut",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", params, cancel).await?;
        *self.capabilities.lock().unwrap() =
            result.get("capabilities").cloned().unwrap_or(Value::Null);
        *self.server_info.lock().unwrap() =
            result.get("serverInfo").cloned().unwrap_or(Value::Null);

        self.transport
            .notify("notifications/initialized", None)
            .await?;
        Ok(())
    }

    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<RemoteTool>, McpError> {
        let result = self.request("tools/list", json!({}), cancel).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .iter()
            .filter_map(|t| {
                Some(RemoteTool {
                    name: t.get("name")?.as_str()?.to_string(),
                    description: t
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                })
            })
            .collect())
    }

    /// `tools/call`, flattening the result content array into text.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, McpError> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                cancel,
            )
            .await?;

        // `isError: true` marks a tool-level failure inside a 200 envelope.
        let text = flatten_content(&result);
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(McpError::Rpc {
                code: 0,
                message: if text.is_empty() {
                    "tool reported an error".into()
                } else {
                    text
                },
            });
        }
        Ok(text)
    }

    pub async fn list_resources(&self, cancel: &CancellationToken) -> Result<Vec<Value>, McpError> {
        let result = self.request("resources/list", json!({}), cancel).await?;
        Ok(result
            .get("resources")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        self.request("resources/read", json!({ "uri": uri }), cancel)
            .await
    }

    pub async fn subscribe_resource(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<(), McpError> {
        self.request("resources/subscribe", json!({ "uri": uri }), cancel)
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe_resource(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<(), McpError> {
        self.request("resources/unsubscribe", json!({ "uri": uri }), cancel)
            .await
            .map(|_| ())
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// Join all `text` items of an MCP content array.
fn flatten_content(result: &Value) -> String {
    match result.get("content").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Transport stub answering from a canned method → result map.
    struct FakeTransport {
        responses: HashMap<String, Value>,
        seen: Arc<Mutex<Vec<(u64, String, Value)>>>,
        notifications: Arc<Mutex<Vec<String>>>,
    }

    impl FakeTransport {
        fn new(responses: HashMap<String, Value>) -> Self {
            Self {
                responses,
                seen: Arc::new(Mutex::new(Vec::new())),
                notifications: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn request(&self, id: u64, method: &str, params: Value) -> Result<Value, McpError> {
            self.seen
                .lock()
                .unwrap()
                .push((id, method.to_string(), params));
            self.responses
                .get(method)
                .cloned()
                .ok_or_else(|| McpError::Rpc {
                    code: -32601,
                    message: format!("method not found: {method}"),
                })
        }

        async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
            self.notifications.lock().unwrap().push(method.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }

    fn client_with(responses: HashMap<String, Value>) -> (McpClient, Arc<Mutex<Vec<(u64, String, Value)>>>, Arc<Mutex<Vec<String>>>) {
        let transport = FakeTransport::new(responses);
        let seen = Arc::clone(&transport.seen);
        let notes = Arc::clone(&transport.notifications);
        (McpClient::new("github", Box::new(transport)), seen, notes)
    }

    #[tokio::test]
    async fn initialize_records_capabilities_and_sends_initialized() {
        let mut responses = HashMap::new();
        responses.insert(
            "initialize".to_string(),
            json!({
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": { "name": "fake", "version": "1.0" },
            }),
        );
        let (client, _seen, notes) = client_with(responses);
        client.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(client.capabilities()["tools"]["listChanged"], true);
        assert_eq!(client.server_info()["name"], "fake");
        assert_eq!(
            notes.lock().unwrap().as_slice(),
            &["notifications/initialized".to_string()]
        );
    }

    #[tokio::test]
    async fn request_ids_are_monotonic() {
        let mut responses = HashMap::new();
        responses.insert("resources/list".to_string(), json!({"resources": []}));
        let (client, seen, _) = client_with(responses);
        let cancel = CancellationToken::new();
        client.list_resources(&cancel).await.unwrap();
        client.list_resources(&cancel).await.unwrap();
        client.list_resources(&cancel).await.unwrap();
        let ids: Vec<u64> = seen.lock().unwrap().iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn list_tools_parses_schema_and_defaults() {
        let mut responses = HashMap::new();
        responses.insert(
            "tools/list".to_string(),
            json!({"tools": [
                {"name": "create_issue", "description": "Create an issue",
                 "inputSchema": {"type": "object", "properties": {"title": {"type": "string"}}}},
                {"name": "bare"},
            ]}),
        );
        let (client, _, _) = client_with(responses);
        let tools = client.list_tools(&CancellationToken::new()).await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "create_issue");
        assert_eq!(tools[0].input_schema["properties"]["title"]["type"], "string");
        assert_eq!(tools[1].description, "");
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[tokio::test]
    async fn call_tool_flattens_text_content() {
        let mut responses = HashMap::new();
        responses.insert(
            "tools/call".to_string(),
            json!({"content": [
                {"type": "text", "text": "Issue #42"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "created"},
            ]}),
        );
        let (client, seen, _) = client_with(responses);
        let out = client
            .call_tool("create_issue", &json!({"title": "Bug"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "Issue #42\ncreated");

        let calls = seen.lock().unwrap();
        let (_, method, params) = &calls[0];
        assert_eq!(method, "tools/call");
        assert_eq!(params["name"], "create_issue");
        assert_eq!(params["arguments"]["title"], "Bug");
    }

    #[tokio::test]
    async fn call_tool_is_error_flag_becomes_error() {
        let mut responses = HashMap::new();
        responses.insert(
            "tools/call".to_string(),
            json!({"isError": true, "content": [{"type": "text", "text": "rate limited"}]}),
        );
        let (client, _, _) = client_with(responses);
        let err = client
            .call_tool("x", &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn rpc_error_propagates() {
        let (client, _, _) = client_with(HashMap::new());
        let err = client
            .call_tool("x", &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_call() {
        struct HangingTransport;

        #[async_trait]
        impl Transport for HangingTransport {
            async fn request(&self, _id: u64, _m: &str, _p: Value) -> Result<Value, McpError> {
                futures::future::pending().await
            }
            async fn notify(&self, _m: &str, _p: Option<Value>) -> Result<(), McpError> {
                Ok(())
            }
            async fn close(&self) {}
        }

        let client = McpClient::new("hang", Box::new(HangingTransport));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .call_tool("x", &json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Cancelled));
    }
}

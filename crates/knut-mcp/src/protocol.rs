// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A JSON-RPC `error` object.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Build a request object.  Request ids are 64-bit and monotonically
/// increasing per client; the caller allocates them.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build a notification (no id — the server must not answer it).
pub fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        None => json!({ "jsonrpc": "2.0", "method": method }),
    }
}

/// A message received from the server.
#[derive(Debug)]
pub enum Incoming {
    /// Response to one of our requests, matched by id.
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    /// Server-initiated notification.
    Notification { method: String, params: Value },
}

/// Classify one incoming JSON object.  Returns `None` for shapes that are
/// neither a response nor a notification (e.g. server-to-client requests,
/// which this client does not service).
pub fn parse_incoming(v: Value) -> Option<Incoming> {
    if let Some(id) = v.get("id").and_then(Value::as_u64) {
        if let Some(error) = v.get("error") {
            return Some(Incoming::Response {
                id,
                result: Err(RpcError {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                    data: error.get("data").cloned(),
                }),
            });
        }
        if v.get("result").is_some() {
            return Some(Incoming::Response {
                id,
                result: Ok(v["result"].clone()),
            });
        }
        // An id with a method is a server-to-client request.
        return None;
    }
    let method = v.get("method")?.as_str()?.to_string();
    Some(Incoming::Notification {
        method,
        params: v.get("params").cloned().unwrap_or(Value::Null),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_jsonrpc_envelope() {
        let r = request(7, "tools/call", json!({"name": "x"}));
        assert_eq!(r["jsonrpc"], "2.0");
        assert_eq!(r["id"], 7);
        assert_eq!(r["method"], "tools/call");
        assert_eq!(r["params"]["name"], "x");
    }

    #[test]
    fn notification_has_no_id() {
        let n = notification("notifications/initialized", None);
        assert!(n.get("id").is_none());
        assert_eq!(n["method"], "notifications/initialized");
        assert!(n.get("params").is_none());
    }

    #[test]
    fn result_response_parses() {
        let v = json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}});
        match parse_incoming(v) {
            Some(Incoming::Response { id, result }) => {
                assert_eq!(id, 3);
                assert!(result.unwrap()["tools"].is_array());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_response_parses() {
        let v = json!({
            "jsonrpc": "2.0", "id": 4,
            "error": {"code": -32601, "message": "method not found"}
        });
        match parse_incoming(v) {
            Some(Incoming::Response { id, result }) => {
                assert_eq!(id, 4);
                let e = result.unwrap_err();
                assert_eq!(e.code, -32601);
                assert_eq!(e.message, "method not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn notification_parses() {
        let v = json!({"jsonrpc": "2.0", "method": "notifications/resources/updated",
                       "params": {"uri": "file:///x"}});
        match parse_incoming(v) {
            Some(Incoming::Notification { method, params }) => {
                assert_eq!(method, "notifications/resources/updated");
                assert_eq!(params["uri"], "file:///x");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn server_to_client_request_is_ignored() {
        let v = json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage"});
        assert!(parse_incoming(v).is_none());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use serde_json::Value;

use crate::McpError;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// A bidirectional JSON-RPC channel to one server.
///
/// `request` resolves when the response with the matching id arrives;
/// responses may come back out of order on the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, id: u64, method: &str, params: Value) -> Result<Value, McpError>;
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;
    async fn close(&self);
}

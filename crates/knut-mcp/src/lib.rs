// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `knut-mcp` — Model Context Protocol client subsystem.
//!
//! Speaks JSON-RPC 2.0 to external tool servers over two transports:
//!
//! - **stdio**: a spawned subprocess, one JSON object per line in each
//!   direction, stderr captured for diagnostics.
//! - **SSE**: a `GET` event stream whose first `event: endpoint` names the
//!   URL subsequent requests are `POST`ed to; responses arrive inline or as
//!   `event: message` frames.
//!
//! The [`manager::McpManager`] reads `.mcp.json`, connects every configured
//! server, and registers each discovered tool in the host's
//! [`knut_tools::ToolRegistry`] as `mcp__<server>__<tool>`.  A server that
//! fails to start is logged and skipped — it never aborts the host.
//!
//! ```text
//! .mcp.json ──► McpManager ──► McpClient ──► StdioTransport / SseTransport
//!                   │
//!                   └──► ToolRegistry (mcp__<server>__<tool> wrappers)
//! ```

pub mod client;
pub mod manager;
pub mod protocol;
pub mod subscriptions;
pub mod transport;
pub mod wrapper;

pub use client::{McpClient, RemoteTool};
pub use manager::McpManager;
pub use protocol::RpcError;
pub use subscriptions::{PollTarget, SubscriptionInfo, SubscriptionKind, SubscriptionStore};

/// Errors from the MCP subsystem.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The server answered with a JSON-RPC `error` object.
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    /// The stdio server process exited; carries captured stderr.
    #[error("server exited: {0}")]
    ServerExited(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("call cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<RpcError> for McpError {
    fn from(e: RpcError) -> Self {
        McpError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

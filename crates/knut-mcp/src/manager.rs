// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use knut_config::McpServerConfig;
use knut_tools::ToolRegistry;

use crate::client::McpClient;
use crate::transport::{SseTransport, StdioTransport, Transport};
use crate::wrapper::McpToolWrapper;
use crate::McpError;

/// Owns the connected MCP clients for the session.
///
/// Startup connects every configured server and registers its tools; a
/// server that fails to spawn, initialize, or list tools is logged and
/// skipped — external servers must never abort the host.
pub struct McpManager {
    clients: Vec<Arc<McpClient>>,
}

impl McpManager {
    /// Connect all configured servers and register their tools.
    /// Servers are processed in name order so registry order is stable.
    pub async fn start(
        servers: HashMap<String, McpServerConfig>,
        registry: &mut ToolRegistry,
        cancel: &CancellationToken,
    ) -> Self {
        let mut names: Vec<&String> = servers.keys().collect();
        names.sort();

        let mut clients = Vec::new();
        for name in names {
            let config = &servers[name];
            match Self::connect_one(name, config, registry, cancel).await {
                Ok(client) => clients.push(client),
                Err(e) => {
                    warn!(server = %name, error = %e, "mcp server failed to start; skipping");
                }
            }
        }
        Self { clients }
    }

    async fn connect_one(
        name: &str,
        config: &McpServerConfig,
        registry: &mut ToolRegistry,
        cancel: &CancellationToken,
    ) -> Result<Arc<McpClient>, McpError> {
        let transport: Box<dyn Transport> = match &config.url {
            Some(url) => Box::new(SseTransport::connect(name, url).await?),
            None => Box::new(StdioTransport::spawn(name, config)?),
        };

        let client = Arc::new(McpClient::new(name, transport));
        client.initialize(cancel).await?;
        let tools = client.list_tools(cancel).await?;
        info!(server = %name, tools = tools.len(), "mcp server connected");

        for remote in tools {
            registry.register(McpToolWrapper::new(Arc::clone(&client), remote));
        }
        Ok(client)
    }

    pub fn clients(&self) -> &[Arc<McpClient>] {
        &self.clients
    }

    pub fn client(&self, server_name: &str) -> Option<&Arc<McpClient>> {
        self.clients.iter().find(|c| c.server_name == server_name)
    }

    /// Close every client; called at host shutdown.
    pub async fn shutdown(&self) {
        for client in &self.clients {
            client.close().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake stdio MCP server: answers initialize, tools/list with one tool,
    /// and tools/call with a canned result.
    fn fake_server() -> McpServerConfig {
        McpServerConfig {
            command: "bash".into(),
            args: vec![
                "-c".into(),
                r#"while IFS= read -r line; do
                     id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
                     case "$line" in
                       *'"initialize"'*)
                         printf '{"jsonrpc":"2.0","id":%s,"result":{"capabilities":{"tools":{}},"serverInfo":{"name":"fake"}}}\n' "$id" ;;
                       *'"tools/list"'*)
                         printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"create_issue","description":"Create an issue","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
                       *'"tools/call"'*)
                         printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"Issue #42"}]}}\n' "$id" ;;
                       *) : ;;
                     esac
                   done"#
                    .into(),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn startup_registers_discovered_tools() {
        let mut servers = HashMap::new();
        servers.insert("github".to_string(), fake_server());
        let mut registry = ToolRegistry::new();
        let manager =
            McpManager::start(servers, &mut registry, &CancellationToken::new()).await;

        assert_eq!(manager.clients().len(), 1);
        assert!(registry.has("mcp__github__create_issue"));
        let def = &registry.definitions()[0];
        assert_eq!(def.description, "Create an issue");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_server_is_skipped_not_fatal() {
        let mut servers = HashMap::new();
        servers.insert(
            "broken".to_string(),
            McpServerConfig {
                command: "/nonexistent/mcp-server".into(),
                ..Default::default()
            },
        );
        servers.insert("github".to_string(), fake_server());

        let mut registry = ToolRegistry::new();
        let manager =
            McpManager::start(servers, &mut registry, &CancellationToken::new()).await;

        // The broken server is skipped; the good one still registers.
        assert_eq!(manager.clients().len(), 1);
        assert!(registry.has("mcp__github__create_issue"));
        assert!(manager.client("github").is_some());
        assert!(manager.client("broken").is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn no_servers_is_an_empty_manager() {
        let mut registry = ToolRegistry::new();
        let manager =
            McpManager::start(HashMap::new(), &mut registry, &CancellationToken::new()).await;
        assert!(manager.clients().is_empty());
        assert!(registry.is_empty());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::McpClient;
use crate::McpError;

/// Floor for polling intervals.
const MIN_POLL_INTERVAL_MS: u64 = 1000;
/// Interval used when the caller passes 0.
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Resource,
    Polling,
}

/// What a polling subscription invokes on each tick.
#[derive(Debug, Clone)]
pub enum PollTarget {
    ToolCall { name: String, args: Value },
    ResourceRead { uri: String },
}

struct Subscription {
    server: String,
    uri: String,
    kind: SubscriptionKind,
    client: Arc<McpClient>,
    /// Present for polling subscriptions; cancelling stops the ticker.
    cancel: Option<CancellationToken>,
}

/// Summary of one live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub server: String,
    pub uri: String,
    pub kind: SubscriptionKind,
}

/// Process-wide subscription registry with monotonic `sub_N` ids.
pub struct SubscriptionStore {
    next: AtomicU64,
    map: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> String {
        format!("sub_{}", self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Subscribe to resource-update notifications for `uri`.
    pub async fn subscribe_resource(
        &self,
        client: Arc<McpClient>,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<String, McpError> {
        client.subscribe_resource(uri, cancel).await?;
        let id = self.next_id();
        self.map.lock().unwrap().insert(
            id.clone(),
            Subscription {
                server: client.server_name.clone(),
                uri: uri.to_string(),
                kind: SubscriptionKind::Resource,
                client,
                cancel: None,
            },
        );
        Ok(id)
    }

    /// Start a polling subscription: a ticker that invokes `target` and
    /// discards the result (side effects are the server's responsibility).
    pub fn subscribe_polling(
        &self,
        client: Arc<McpClient>,
        target: PollTarget,
        interval_ms: u64,
    ) -> String {
        let interval_ms = if interval_ms == 0 {
            DEFAULT_POLL_INTERVAL_MS
        } else {
            interval_ms.max(MIN_POLL_INTERVAL_MS)
        };

        let id = self.next_id();
        let cancel = CancellationToken::new();
        let uri = match &target {
            PollTarget::ToolCall { name, .. } => format!("tool:{name}"),
            PollTarget::ResourceRead { uri } => uri.clone(),
        };

        {
            let client = Arc::clone(&client);
            let cancel = cancel.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(interval_ms));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick of tokio's interval fires immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let result = match &target {
                        PollTarget::ToolCall { name, args } => client
                            .call_tool(name, args, &cancel)
                            .await
                            .map(|_| ()),
                        PollTarget::ResourceRead { uri } => {
                            client.read_resource(uri, &cancel).await.map(|_| ())
                        }
                    };
                    match result {
                        Ok(()) => debug!(%id, "poll tick"),
                        Err(McpError::Cancelled) => break,
                        Err(e) => warn!(%id, error = %e, "poll tick failed"),
                    }
                }
            });
        }

        self.map.lock().unwrap().insert(
            id.clone(),
            Subscription {
                server: client.server_name.clone(),
                uri,
                kind: SubscriptionKind::Polling,
                client,
                cancel: Some(cancel),
            },
        );
        id
    }

    /// Stop a polling subscription's ticker and drop the entry.
    pub fn unsubscribe_polling(&self, id: &str) -> Result<(), McpError> {
        let sub = self
            .map
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| McpError::Protocol(format!("unknown subscription {id}")))?;
        if let Some(cancel) = sub.cancel {
            cancel.cancel();
        }
        Ok(())
    }

    /// Send `resources/unsubscribe` and drop the entry.
    pub async fn unsubscribe_resource(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), McpError> {
        let sub = self
            .map
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| McpError::Protocol(format!("unknown subscription {id}")))?;
        sub.client.unsubscribe_resource(&sub.uri, cancel).await
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        let mut out: Vec<SubscriptionInfo> = self
            .map
            .lock()
            .unwrap()
            .iter()
            .map(|(id, s)| SubscriptionInfo {
                id: id.clone(),
                server: s.server.clone(),
                uri: s.uri.clone(),
                kind: s.kind,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Cancel every polling ticker; resource entries are simply dropped.
    pub fn shutdown(&self) {
        let mut map = self.map.lock().unwrap();
        for (_, sub) in map.drain() {
            if let Some(cancel) = sub.cancel {
                cancel.cancel();
            }
        }
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn request(&self, _id: u64, method: &str, _params: Value) -> Result<Value, McpError> {
            if method == "tools/call" || method == "resources/read" {
                self.calls.fetch_add(1, Ordering::SeqCst);
            }
            Ok(json!({}))
        }
        async fn notify(&self, _m: &str, _p: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn counting_client() -> (Arc<McpClient>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(McpClient::new(
            "poller",
            Box::new(CountingTransport {
                calls: Arc::clone(&calls),
            }),
        ));
        (client, calls)
    }

    #[test]
    fn ids_are_monotonic_sub_n() {
        let store = SubscriptionStore::new();
        assert_eq!(store.next_id(), "sub_1");
        assert_eq!(store.next_id(), "sub_2");
        assert_eq!(store.next_id(), "sub_3");
    }

    #[tokio::test]
    async fn resource_subscription_is_recorded() {
        let (client, _) = counting_client();
        let store = SubscriptionStore::new();
        let id = store
            .subscribe_resource(client, "file:///logs", &CancellationToken::new())
            .await
            .unwrap();
        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert_eq!(list[0].server, "poller");
        assert_eq!(list[0].uri, "file:///logs");
        assert_eq!(list[0].kind, SubscriptionKind::Resource);
    }

    #[tokio::test]
    async fn unsubscribe_resource_sends_rpc_and_removes_entry() {
        let (client, _) = counting_client();
        let store = SubscriptionStore::new();
        let id = store
            .subscribe_resource(client, "file:///logs", &CancellationToken::new())
            .await
            .unwrap();
        store
            .unsubscribe_resource(&id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(store.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_ticks_invoke_and_discard() {
        let (client, calls) = counting_client();
        let store = SubscriptionStore::new();
        let id = store.subscribe_polling(
            client,
            PollTarget::ToolCall {
                name: "check_inbox".into(),
                args: json!({}),
            },
            1000,
        );

        // Paused-clock runtime: sleeping fast-forwards virtual time past
        // several tick intervals while the poll task gets scheduled.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(
            calls.load(Ordering::SeqCst) >= 2,
            "expected at least two poll ticks, got {}",
            calls.load(Ordering::SeqCst)
        );

        store.unsubscribe_polling(&id).unwrap();
        tokio::task::yield_now().await;
        let after = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after, "ticker must stop");
    }

    #[tokio::test]
    async fn polling_interval_floor_is_applied() {
        let (client, _) = counting_client();
        let store = SubscriptionStore::new();
        // 1 ms asks for a floor clamp; just verify registration works.
        let id = store.subscribe_polling(
            client,
            PollTarget::ResourceRead {
                uri: "file:///x".into(),
            },
            1,
        );
        assert_eq!(store.list()[0].kind, SubscriptionKind::Polling);
        store.unsubscribe_polling(&id).unwrap();
    }

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let store = SubscriptionStore::new();
        assert!(store.unsubscribe_polling("sub_999").is_err());
        assert!(store
            .unsubscribe_resource("sub_999", &CancellationToken::new())
            .await
            .is_err());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use knut_config::McpServerConfig;

use crate::protocol::{self, Incoming, RpcError};
use crate::transport::Transport;
use crate::McpError;

/// Ceiling for one newline-delimited JSON message.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long a graceful shutdown waits after closing stdin before killing.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// Subprocess transport: one JSON object per line on stdin/stdout.
///
/// A dedicated reader task demuxes responses into per-request oneshot slots
/// by id; writes are serialized through a mutex so interleaved requests
/// cannot corrupt the line framing.
pub struct StdioTransport {
    server_name: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pending: PendingMap,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Spawn the configured command and start the reader tasks.
    pub fn spawn(server_name: &str, config: &McpServerConfig) -> Result<Self, McpError> {
        if config.command.is_empty() {
            return Err(McpError::Transport(format!(
                "server {server_name} has no command configured"
            )));
        }
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        debug!(server = server_name, command = %config.command, "spawning mcp server");
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Transport("child stderr unavailable".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));

        // Stderr capture: keep the most recent lines for error reporting.
        {
            let tail = Arc::clone(&stderr_tail);
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "stderr: {line}");
                    let mut tail = tail.lock().unwrap();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        // Reader: demux responses by id, log notifications.
        {
            let pending = Arc::clone(&pending);
            let tail = Arc::clone(&stderr_tail);
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(server = %name, error = %e, "mcp stdout read failed");
                            break;
                        }
                    }
                    if line.len() > MAX_LINE_BYTES {
                        warn!(server = %name, bytes = line.len(), "mcp message exceeds line ceiling; closing");
                        break;
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                        warn!(server = %name, "mcp server wrote invalid JSON line");
                        continue;
                    };
                    match protocol::parse_incoming(value) {
                        Some(Incoming::Response { id, result }) => {
                            let slot = pending.lock().unwrap().remove(&id);
                            match slot {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => {
                                    warn!(server = %name, id, "response for unknown request id")
                                }
                            }
                        }
                        Some(Incoming::Notification { method, .. }) => {
                            debug!(server = %name, %method, "mcp notification");
                        }
                        None => {}
                    }
                }
                // Server is gone: fail every in-flight request with the
                // captured stderr so callers see why.
                let stderr_text = tail.lock().unwrap().iter().cloned().collect::<Vec<_>>().join("\n");
                let mut pending = pending.lock().unwrap();
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(RpcError {
                        code: -1,
                        message: format!("server exited: {stderr_text}"),
                        data: None,
                    }));
                }
            });
        }

        Ok(Self {
            server_name: server_name.to_string(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(Some(child)),
            pending,
            stderr_tail,
        })
    }

    async fn write_line(&self, value: &Value) -> Result<(), McpError> {
        let mut line = value.to_string();
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("connection closed".into()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn stderr_text(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, id: u64, method: &str, params: Value) -> Result<Value, McpError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let body = protocol::request(id, method, params);
        if let Err(e) = self.write_line(&body).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rpc)) => Err(rpc.into()),
            Err(_) => Err(McpError::ServerExited(self.stderr_text())),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_line(&protocol::notification(method, params)).await
    }

    /// Graceful close: drop stdin so the server sees EOF, wait up to the
    /// grace period, then kill.
    async fn close(&self) {
        self.stdin.lock().await.take();
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(status) => {
                    debug!(server = %self.server_name, ?status, "mcp server exited");
                }
                Err(_) => {
                    warn!(server = %self.server_name, "mcp server did not exit; killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(command: &str, args: &[&str]) -> McpServerConfig {
        McpServerConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// A fake MCP server in bash: answers every request line with a
    /// result envelope echoing the request id.
    fn echo_server() -> McpServerConfig {
        config(
            "bash",
            &[
                "-c",
                r#"while IFS= read -r line; do
                     id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
                     if [ -n "$id" ]; then
                       printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
                     fi
                   done"#,
            ],
        )
    }

    #[tokio::test]
    async fn request_resolves_by_id() {
        let t = StdioTransport::spawn("echo", &echo_server()).unwrap();
        let result = t.request(1, "tools/list", json!({})).await.unwrap();
        assert_eq!(result["ok"], true);
        t.close().await;
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_the_right_callers() {
        // Server answers id 2 before id 1.
        let cfg = config(
            "bash",
            &[
                "-c",
                r#"read -r _a; read -r _b;
                   printf '{"jsonrpc":"2.0","id":2,"result":{"who":2}}\n'
                   printf '{"jsonrpc":"2.0","id":1,"result":{"who":1}}\n'
                   cat > /dev/null"#,
            ],
        );
        let t = Arc::new(StdioTransport::spawn("swap", &cfg).unwrap());
        let t1 = Arc::clone(&t);
        let a = tokio::spawn(async move { t1.request(1, "m", json!({})).await });
        // Ensure request 1 is written before request 2.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let t2 = Arc::clone(&t);
        let b = tokio::spawn(async move { t2.request(2, "m", json!({})).await });

        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();
        assert_eq!(ra["who"], 1);
        assert_eq!(rb["who"], 2);
        t.close().await;
    }

    #[tokio::test]
    async fn rpc_error_object_becomes_call_error() {
        let cfg = config(
            "bash",
            &[
                "-c",
                r#"read -r _line
                   printf '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}\n'
                   cat > /dev/null"#,
            ],
        );
        let t = StdioTransport::spawn("err", &cfg).unwrap();
        let err = t.request(1, "missing/method", json!({})).await.unwrap_err();
        match err {
            McpError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
        t.close().await;
    }

    #[tokio::test]
    async fn server_exit_surfaces_stderr_in_error() {
        // Emits a diagnostic, then dies after the first request without
        // answering it.
        let cfg = config(
            "bash",
            &["-c", "echo 'fatal: bad config' >&2; read -r _line; exit 1"],
        );
        let t = StdioTransport::spawn("dead", &cfg).unwrap();
        // Let the stderr line land in the tail buffer first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = t.request(1, "tools/list", json!({})).await.unwrap_err();
        let text = err.to_string();
        assert!(
            text.contains("fatal: bad config"),
            "stderr should surface: {text}"
        );
        t.close().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let cfg = config("/nonexistent/binary/for/sure", &[]);
        assert!(StdioTransport::spawn("ghost", &cfg).is_err());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let cfg = McpServerConfig::default();
        assert!(matches!(
            StdioTransport::spawn("blank", &cfg),
            Err(McpError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn notify_writes_without_waiting() {
        let t = StdioTransport::spawn("echo", &echo_server()).unwrap();
        t.notify("notifications/initialized", None).await.unwrap();
        // Follow-up request still works on the same pipe.
        let result = t.request(5, "tools/list", json!({})).await.unwrap();
        assert_eq!(result["ok"], true);
        t.close().await;
    }
}

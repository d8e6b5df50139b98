// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use knut_hooks::{HookInput, HookOutcome, HookRunner};
use knut_model::{
    CompletionRequest, ContentBlock, Message, ModelProvider, StreamEvent, ToolDef, Usage,
};
use knut_tools::{ExecuteError, PermissionGate, ToolCall, ToolRegistry};

use crate::compact::Compactor;
use crate::error::HostError;
use crate::handler::Handler;
use crate::session::{Session, SessionStore};

#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub context_window: usize,
    pub max_output_tokens: u32,
    /// Bound on model↔tool rounds within one turn.
    pub max_tool_rounds: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            context_window: 200_000,
            max_output_tokens: 8192,
            max_tool_rounds: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Aggregated usage across all model requests in the turn.
    pub usage: Usage,
}

/// Drives one agentic turn at a time: user message → streamed assistant
/// responses interleaved with tool execution, until the assistant stops
/// requesting tools.
///
/// The loop is the sole owner and mutator of the session history; tools run
/// serially in the order their `ToolUse` blocks were emitted, and every
/// `ToolUse` gets exactly one closing `ToolResult` before the next model
/// request — including on cancellation, where unexecuted calls get
/// synthesized error results.
pub struct ConversationLoop {
    session: Session,
    store: Option<SessionStore>,
    model: Arc<dyn ModelProvider>,
    registry: Arc<RwLock<ToolRegistry>>,
    hooks: Arc<HookRunner>,
    gate: Arc<PermissionGate>,
    handler: Arc<dyn Handler>,
    compactor: Compactor,
    cancel: CancellationToken,
    system: Vec<String>,
    config: LoopConfig,
    session_started: bool,
}

impl ConversationLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Session,
        store: Option<SessionStore>,
        model: Arc<dyn ModelProvider>,
        registry: Arc<RwLock<ToolRegistry>>,
        hooks: Arc<HookRunner>,
        gate: Arc<PermissionGate>,
        handler: Arc<dyn Handler>,
        system: Vec<String>,
        config: LoopConfig,
    ) -> Self {
        Self {
            session,
            store,
            model,
            registry,
            hooks,
            gate,
            handler,
            compactor: Compactor::default(),
            cancel: CancellationToken::new(),
            system,
            config,
            session_started: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    /// Token cancelling the in-flight stream and the current tool.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Install a fresh cancellation token for the next turn and return it.
    /// A cancelled token is not reusable; interactive drivers call this
    /// after an interrupted turn.
    pub fn reset_cancel(&mut self) -> CancellationToken {
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    /// Run one agentic turn.
    pub async fn run_turn(&mut self, user_text: &str) -> Result<TurnOutcome, HostError> {
        if self.cancel.is_cancelled() {
            return Ok(TurnOutcome {
                status: TurnStatus::Cancelled,
                usage: Usage::default(),
            });
        }

        if !self.session_started {
            self.session_started = true;
            self.hooks.fire(HookInput::SessionStart, &self.cancel).await;
        }

        // UserPromptSubmit hooks may rewrite or block the prompt before the
        // model ever sees it.  On block, history stays untouched.
        let mut text = user_text.to_string();
        let prompt_outcome = self
            .hooks
            .fire(HookInput::UserPromptSubmit { message: &text }, &self.cancel)
            .await;
        match prompt_outcome {
            HookOutcome::Continue => {}
            HookOutcome::Replace(rewritten) => {
                debug!("user prompt rewritten by hook");
                text = rewritten;
            }
            HookOutcome::Blocked { message } => {
                let err = HostError::HookBlocked(message);
                self.handler.on_error(&err);
                return Err(err);
            }
        }

        // Queued prompt-hook content rides along with the user message.
        if let Some(reminders) = self.hooks.queue().drain_as_reminders() {
            text = format!("{text}\n\n{reminders}");
        }

        self.maybe_compact().await;
        self.session.push(Message::user(text));

        let mut usage_total = Usage::default();
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                // Give the model one final tool-free turn to wrap up rather
                // than stopping abruptly mid-task.
                self.session.push(Message::user(format!(
                    "You have reached the tool-call budget for this turn ({} rounds). \
                     Do not call any more tools; summarize what was done and what remains.",
                    self.config.max_tool_rounds
                )));
                let streamed = self.stream_assistant(false, &mut usage_total).await?;
                if let StreamedMessage::Complete(message) = streamed {
                    self.finish_assistant_message(message);
                }
                break;
            }

            let streamed = self.stream_assistant(true, &mut usage_total).await?;
            let message = match streamed {
                StreamedMessage::Complete(message) => message,
                StreamedMessage::Interrupted(partial) => {
                    if let Some(partial) = partial {
                        self.session.push(partial);
                    }
                    self.save();
                    return Ok(TurnOutcome {
                        status: TurnStatus::Cancelled,
                        usage: usage_total,
                    });
                }
            };

            let had_tools = message.has_tool_use();
            let tool_uses: Vec<(String, String, Value)> = message
                .tool_uses()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            self.finish_assistant_message(message);

            if !had_tools {
                break;
            }

            let (results, cancelled) = self.run_tool_phase(&tool_uses).await;
            let mut blocks = results;
            if let Some(reminders) = self.hooks.queue().drain_as_reminders() {
                blocks.push(ContentBlock::text(reminders));
            }
            self.session.push(Message::user_blocks(blocks));

            if cancelled {
                self.save();
                return Ok(TurnOutcome {
                    status: TurnStatus::Cancelled,
                    usage: usage_total,
                });
            }

            self.maybe_compact().await;
        }

        self.hooks.fire(HookInput::Stop, &self.cancel).await;
        self.save();
        Ok(TurnOutcome {
            status: TurnStatus::Complete,
            usage: usage_total,
        })
    }

    fn finish_assistant_message(&mut self, message: Message) {
        self.handler.on_assistant_message_complete(&message);
        self.session.push(message);
    }

    /// Execute the turn's tool calls serially, in emission order.
    ///
    /// Returns the closing `ToolResult` blocks (one per `ToolUse`, same
    /// order) and whether cancellation cut the phase short — in which case
    /// the remaining calls got synthesized error results so history stays
    /// closed.
    async fn run_tool_phase(
        &mut self,
        tool_uses: &[(String, String, Value)],
    ) -> (Vec<ContentBlock>, bool) {
        let mut results = Vec::with_capacity(tool_uses.len());
        let mut cancelled = false;

        for (id, name, input) in tool_uses {
            if cancelled || self.cancel.is_cancelled() {
                cancelled = true;
                results.push(ContentBlock::tool_error(id.as_str(), "cancelled"));
                continue;
            }

            let block = self.run_one_tool(id, name, input).await;
            self.handler.on_tool_result(&block);

            let (output_text, is_error) = match &block {
                ContentBlock::ToolResult {
                    content, is_error, ..
                } => (content.clone(), *is_error),
                _ => (String::new(), false),
            };
            self.hooks
                .fire(
                    HookInput::PostToolUse {
                        tool_name: name,
                        tool_input: input,
                        tool_output: &output_text,
                        is_error,
                    },
                    &self.cancel,
                )
                .await;

            results.push(block);
        }

        (results, cancelled)
    }

    async fn run_one_tool(&self, id: &str, name: &str, input: &Value) -> ContentBlock {
        // PreToolUse hooks can veto the call; a block becomes a
        // deterministic error result, not a turn failure.
        if let HookOutcome::Blocked { message } = self
            .hooks
            .fire(
                HookInput::PreToolUse {
                    tool_name: name,
                    tool_input: input,
                },
                &self.cancel,
            )
            .await
        {
            warn!(tool = name, "tool call blocked by hook");
            return ContentBlock::tool_error(id, format!("hook blocked this call: {message}"));
        }

        let registry = self.registry.read().await;

        // Surface the PermissionRequest event for calls that will prompt.
        if let Some(tool) = registry.get(name) {
            if tool.requires_permission(input) {
                let decision = self.gate.evaluate(name, input, &self.session.cwd);
                if decision.behavior == knut_tools::Behavior::Ask {
                    self.hooks
                        .fire(
                            HookInput::PermissionRequest {
                                tool_name: name,
                                tool_input: input,
                            },
                            &self.cancel,
                        )
                        .await;
                }
            }
        }

        let ctx = knut_tools::ExecContext::new(
            self.session.cwd.clone(),
            self.cancel.child_token(),
            Arc::clone(&self.gate),
        );
        let call = ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            args: input.clone(),
        };

        match registry.execute(&ctx, &call).await {
            Ok(output) if output.is_error => ContentBlock::tool_error(id, output.content),
            Ok(output) => ContentBlock::tool_result(id, output.content),
            Err(ExecuteError::UnknownTool(name)) => {
                ContentBlock::tool_error(id, format!("unknown tool: {name}"))
            }
            Err(ExecuteError::PermissionDenied(reason)) => {
                ContentBlock::tool_error(id, format!("permission denied: {reason}"))
            }
        }
    }

    /// One streamed model request.  Accumulates the assistant message from
    /// the event stream, forwarding deltas to the handler as they arrive.
    async fn stream_assistant(
        &mut self,
        with_tools: bool,
        usage_total: &mut Usage,
    ) -> Result<StreamedMessage, HostError> {
        let tools: Vec<ToolDef> = if with_tools {
            self.registry
                .read()
                .await
                .definitions()
                .into_iter()
                .map(|d| ToolDef {
                    name: d.name,
                    description: d.description,
                    input_schema: d.input_schema,
                })
                .collect()
        } else {
            Vec::new()
        };

        let request = CompletionRequest {
            model: self.session.model.clone(),
            system: self.system.clone(),
            messages: self.session.history.clone(),
            tools,
            max_tokens: self.config.max_output_tokens,
        };

        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Ok(StreamedMessage::Interrupted(None));
            }
            result = self.model.complete(request) => {
                result.map_err(classify_model_error).map_err(|e| {
                    self.handler.on_error(&e);
                    e
                })?
            }
        };

        let mut collector = BlockCollector::default();
        let mut usage = Usage::default();
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(StreamedMessage::Interrupted(collector.into_interrupted()));
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            match event {
                Ok(StreamEvent::TextDelta(delta)) => {
                    self.handler.on_text_delta(&delta);
                    collector.text(&delta);
                }
                Ok(StreamEvent::ThoughtDelta(delta)) => {
                    self.handler.on_thought_delta(&delta);
                    collector.thought(&delta);
                }
                Ok(StreamEvent::ToolUseStart { index, id, name }) => {
                    self.handler.on_tool_use_begin(&id, &name);
                    collector.tool_start(index, id, name);
                }
                Ok(StreamEvent::ToolUseDelta {
                    index,
                    partial_json,
                }) => {
                    collector.tool_delta(index, &partial_json);
                }
                Ok(StreamEvent::Usage(u)) => {
                    usage.input_tokens += u.input_tokens;
                    usage.output_tokens += u.output_tokens;
                    usage.cache_read += u.cache_read;
                    usage.cache_creation += u.cache_creation;
                    self.handler.on_usage(&u);
                }
                Ok(StreamEvent::Done) => break,
                Err(e) => {
                    let err = classify_model_error(e);
                    self.handler.on_error(&err);
                    return Err(err);
                }
            }
        }

        usage_total.input_tokens += usage.input_tokens;
        usage_total.output_tokens += usage.output_tokens;
        usage_total.cache_read += usage.cache_read;
        usage_total.cache_creation += usage.cache_creation;

        let mut message = collector.into_message();
        message.usage = Some(usage);
        for (id, name, input) in message.tool_uses() {
            self.handler.on_tool_use_end(id, name, input);
        }
        Ok(StreamedMessage::Complete(message))
    }

    async fn maybe_compact(&mut self) {
        let result = self
            .compactor
            .maybe_compact(
                &mut self.session,
                self.model.as_ref(),
                &self.system,
                self.config.context_window,
                self.config.max_output_tokens,
            )
            .await;
        match result {
            Ok(Some(stats)) => {
                debug!(
                    tokens_before = stats.tokens_before,
                    tokens_after = stats.tokens_after,
                    "history compacted"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "compaction failed; continuing uncompacted"),
        }
    }

    fn save(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.session) {
                warn!(error = %e, "failed to persist session");
            }
        }
    }
}

enum StreamedMessage {
    Complete(Message),
    /// Cancellation mid-stream; carries the partial assistant message (if
    /// any text was flushed) finalized with an interrupted marker.
    Interrupted(Option<Message>),
}

/// Accumulates stream events into content blocks.
///
/// Tool-use argument deltas are keyed by the provider's block index and may
/// interleave; blocks are finalized in index order.
#[derive(Default)]
struct BlockCollector {
    thought: String,
    text: String,
    tools: BTreeMap<u32, PendingToolUse>,
}

struct PendingToolUse {
    id: String,
    name: String,
    args: String,
}

impl BlockCollector {
    fn text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    fn thought(&mut self, delta: &str) {
        self.thought.push_str(delta);
    }

    fn tool_start(&mut self, index: u32, id: String, name: String) {
        self.tools.insert(
            index,
            PendingToolUse {
                id,
                name,
                args: String::new(),
            },
        );
    }

    fn tool_delta(&mut self, index: u32, partial: &str) {
        if let Some(pending) = self.tools.get_mut(&index) {
            pending.args.push_str(partial);
        }
    }

    fn into_message(self) -> Message {
        let mut blocks = Vec::new();
        if !self.thought.is_empty() {
            blocks.push(ContentBlock::Thought { text: self.thought });
        }
        if !self.text.is_empty() {
            blocks.push(ContentBlock::Text { text: self.text });
        }
        for (_, pending) in self.tools {
            if pending.name.is_empty() {
                // Cannot be dispatched or replayed; storing it would
                // corrupt the history sent back on the next request.
                warn!(id = %pending.id, "dropping tool use with empty name");
                continue;
            }
            let input: Value = if pending.args.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&pending.args).unwrap_or_else(|e| {
                    warn!(tool = %pending.name, error = %e,
                          "tool use arguments are not valid JSON; substituting {{}}");
                    Value::Object(Default::default())
                })
            };
            blocks.push(ContentBlock::ToolUse {
                id: pending.id,
                name: pending.name,
                input,
            });
        }
        Message::assistant_blocks(blocks)
    }

    /// Partial message for a cancelled stream: flushed text is retained and
    /// marked; pending tool uses are dropped so no `ToolUse` goes unclosed.
    fn into_interrupted(self) -> Option<Message> {
        if self.text.is_empty() && self.thought.is_empty() {
            return None;
        }
        let mut blocks = Vec::new();
        if !self.thought.is_empty() {
            blocks.push(ContentBlock::Thought { text: self.thought });
        }
        let mut text = self.text;
        text.push_str("\n[interrupted]");
        blocks.push(ContentBlock::Text { text });
        Some(Message::assistant_blocks(blocks))
    }
}

fn classify_model_error(e: anyhow::Error) -> HostError {
    if let Some(auth) = e.downcast_ref::<knut_auth::AuthError>() {
        return match auth {
            knut_auth::AuthError::NotConfigured => HostError::AuthNotConfigured,
            other => HostError::AuthRejected(other.to_string()),
        };
    }
    let text = format!("{e:#}");
    if text.contains("401") || text.contains("authentication") {
        HostError::AuthRejected(text)
    } else if text.contains("API error 4") {
        HostError::Protocol(text)
    } else {
        HostError::NetworkTransient(text)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod client;
pub mod mock;
pub mod types;
pub mod wire;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

pub use client::ApiClient;
pub use mock::MockModel;
pub use types::{
    CompletionRequest, ContentBlock, Message, Role, StreamEvent, ToolDef, Usage,
};

/// Streamed model events, in wire order.
pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// A model endpoint that can stream one completion.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model(&self) -> &str;
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<EventStream>;
}

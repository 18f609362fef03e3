// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{ChatRequest, ChatResponse, ProviderError};

/// Finite, non-restartable sequence of text deltas from a streaming call.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// One chat-completion provider, normalized.
///
/// Adapters own the wire-format translation in both directions: request
/// shape (system-prompt slot, sampling-parameter names, tool schema) and
/// response shape (assistant text, tool-call detection, usage counters).
/// They are stateless with respect to conversations; one instance is bound
/// to one credential.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Stable provider id (`"openai"`, `"anthropic"`, ...).
    fn provider(&self) -> &str;

    /// Send a completion request and wait for the full response.
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Send a completion request and return the text deltas as they arrive.
    ///
    /// Tool calls are not surfaced on this path; callers that advertise
    /// tools use [`ChatAdapter::complete`].
    async fn complete_streaming(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError>;
}

impl std::fmt::Debug for dyn ChatAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatAdapter").field("provider", &self.provider()).finish()
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use crate::{
    adapter::DeltaStream, ChatAdapter, ChatRequest, ChatResponse, ProviderError, Role, Usage,
};

/// Deterministic mock adapter for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockAdapter;

fn last_user_text(req: &ChatRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_else(|| "[no input]".into())
}

#[async_trait]
impl ChatAdapter for MockAdapter {
    fn provider(&self) -> &str {
        "mock"
    }

    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            content: last_user_text(req),
            usage: Usage::new(10, 10),
            tool_calls: vec![],
            model: req.api_name.clone(),
        })
    }

    async fn complete_streaming(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let text = last_user_text(req);
        Ok(Box::pin(stream::iter(vec![Ok(text)])))
    }
}

/// One pre-scripted adapter outcome.
pub enum ScriptStep {
    /// Return this response as-is.
    Reply(ChatResponse),
    /// Fail with a classified HTTP-status error.
    Fail { status: u16, body: String },
}

impl ScriptStep {
    pub fn text(t: impl Into<String>) -> Self {
        Self::Reply(ChatResponse {
            content: t.into(),
            usage: Usage::new(5, 5),
            tool_calls: vec![],
            model: "scripted-mock".into(),
        })
    }

    pub fn fail(status: u16) -> Self {
        Self::Fail {
            status,
            body: format!("scripted failure {status}"),
        }
    }
}

/// A pre-scripted adapter.  Each `complete` call pops the next step from the
/// front of the script; tests can specify exact outcome sequences, including
/// tool calls and classified failures, without network access.
pub struct ScriptedAdapter {
    provider_id: String,
    script: Mutex<Vec<ScriptStep>>,
    /// Reply used once the script is exhausted (or when the script is empty).
    default_text: Option<String>,
    /// Requests seen so far, for wire-level assertions.
    pub requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedAdapter {
    pub fn new(provider_id: impl Into<String>, script: Vec<ScriptStep>) -> Self {
        Self {
            provider_id: provider_id.into(),
            script: Mutex::new(script),
            default_text: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Convenience: adapter that always returns the same text reply.
    pub fn always_text(provider_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut a = Self::new(provider_id, Vec::new());
        a.default_text = Some(text.into());
        a
    }

    /// Sleep this long before answering — for competitive/timeout tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `complete` calls that reached this adapter.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn pop_step(&self) -> Option<ScriptStep> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            None
        } else {
            Some(script.remove(0))
        }
    }
}

#[async_trait]
impl ChatAdapter for ScriptedAdapter {
    fn provider(&self) -> &str {
        &self.provider_id
    }

    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req.clone());

        match self.pop_step() {
            Some(ScriptStep::Reply(mut r)) => {
                if r.model.is_empty() {
                    r.model = req.api_name.clone();
                }
                Ok(r)
            }
            Some(ScriptStep::Fail { status, body }) => Err(ProviderError::from_status(
                &self.provider_id,
                status,
                &body,
                None,
            )),
            None => match &self.default_text {
                Some(t) => Ok(ChatResponse {
                    content: t.clone(),
                    usage: Usage::new(5, 5),
                    tool_calls: vec![],
                    model: req.api_name.clone(),
                }),
                None => Ok(ChatResponse {
                    content: "[no more scripts]".into(),
                    usage: Usage::default(),
                    tool_calls: vec![],
                    model: req.api_name.clone(),
                }),
            },
        }
    }

    async fn complete_streaming(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let resp = self.complete(req).await?;
        Ok(Box::pin(stream::iter(vec![Ok(resp.content)])))
    }
}

/// Adapter that fails every call with the same classified status.
pub struct FailingAdapter {
    provider_id: String,
    status: u16,
    calls: AtomicUsize,
}

impl FailingAdapter {
    pub fn new(provider_id: impl Into<String>, status: u16) -> Self {
        Self {
            provider_id: provider_id.into(),
            status,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatAdapter for FailingAdapter {
    fn provider(&self) -> &str {
        &self.provider_id
    }

    async fn complete(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::from_status(
            &self.provider_id,
            self.status,
            "always failing",
            None,
        ))
    }

    async fn complete_streaming(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        match self.complete(req).await {
            Ok(_) => unreachable!("FailingAdapter never succeeds"),
            Err(e) => Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatMessage;

    fn req(text: &str) -> ChatRequest {
        ChatRequest {
            api_name: "mock-model".into(),
            messages: vec![ChatMessage::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let a = MockAdapter;
        let r = a.complete(&req("hi")).await.unwrap();
        assert_eq!(r.content, "hi");
        assert_eq!(r.model, "mock-model");
    }

    #[tokio::test]
    async fn scripted_pops_steps_in_order() {
        let a = ScriptedAdapter::new(
            "mock",
            vec![ScriptStep::text("one"), ScriptStep::fail(500), ScriptStep::text("two")],
        );
        assert_eq!(a.complete(&req("x")).await.unwrap().content, "one");
        let e = a.complete(&req("x")).await.unwrap_err();
        assert_eq!(e.kind(), "server_error");
        assert_eq!(a.complete(&req("x")).await.unwrap().content, "two");
        assert_eq!(a.call_count(), 3);
    }

    #[tokio::test]
    async fn scripted_records_requests() {
        let a = ScriptedAdapter::new("mock", vec![ScriptStep::text("r")]);
        a.complete(&req("question")).await.unwrap();
        let seen = a.requests.lock().unwrap();
        assert_eq!(seen[0].messages[0].content, "question");
    }

    #[tokio::test]
    async fn always_text_never_runs_out() {
        let a = ScriptedAdapter::always_text("mock", "same");
        for _ in 0..3 {
            assert_eq!(a.complete(&req("x")).await.unwrap().content, "same");
        }
    }

    #[tokio::test]
    async fn failing_adapter_counts_calls() {
        let a = FailingAdapter::new("mock", 503);
        assert!(a.complete(&req("x")).await.is_err());
        assert!(a.complete(&req("x")).await.is_err());
        assert_eq!(a.call_count(), 2);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared adapter for OpenAI-compatible chat completion APIs.
//!
//! Many providers speak the same `/chat/completions` wire format (OpenAI,
//! Groq, OpenRouter, Mistral, DeepSeek, Ollama, ...).  This module provides
//! a single [`OpenAiCompatAdapter`] that each provider configures with its
//! own base URL, auth style and extra headers.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure-style gateways)
//! - `None` — no authentication (local servers)

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    adapter::DeltaStream, ChatAdapter, ChatMessage, ChatRequest, ChatResponse, ProviderError,
    Role, ToolCall, Usage,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — standard for most providers.
    Bearer,
    /// `api-key: <key>` — Azure OpenAI style.
    ApiKeyHeader,
    /// No authentication header — local servers.
    None,
}

pub struct OpenAiCompatAdapter {
    provider_id: String,
    api_key: Option<String>,
    /// Full chat completions URL, e.g. `https://api.groq.com/openai/v1/chat/completions`.
    chat_url: String,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: Option<String>,
        base_url: &str,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            provider_id: provider_id.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            extra_headers,
            auth_style,
            client: reqwest::Client::new(),
        }
    }

    fn request_builder(&self) -> Result<reqwest::RequestBuilder, ProviderError> {
        let mut builder = self.client.post(&self.chat_url);
        match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.require_key()?;
                builder = builder.bearer_auth(key);
            }
            AuthStyle::ApiKeyHeader => {
                let key = self.require_key()?;
                builder = builder.header("api-key", key);
            }
            AuthStyle::None => {}
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }

    fn require_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Authentication {
                provider: self.provider_id.clone(),
                message: "no API key configured".into(),
            })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        debug!(provider = %self.provider_id, url = %self.chat_url, "sending chat request");
        let resp = self
            .request_builder()?
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.provider_id, e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                &self.provider_id,
                status.as_u16(),
                &text,
                retry_after,
            ));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatAdapter for OpenAiCompatAdapter {
    fn provider(&self) -> &str {
        &self.provider_id
    }

    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_body(req, false);
        let resp = self.send(&body).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::transport(&self.provider_id, e))?;
        parse_response(&self.provider_id, &v)
    }

    async fn complete_streaming(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let body = build_body(req, true);
        let resp = self.send(&body).await?;
        let provider = self.provider_id.clone();

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete lines are parsed.
        let deltas = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        let err = ProviderError::Transport {
                            provider: provider.clone(),
                            message: e.to_string(),
                        };
                        return futures::future::ready(Some(vec![Err(err)]));
                    }
                };
                buf.push_str(&text);
                let mut out = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        if data == "[DONE]" {
                            continue;
                        }
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            if let Some(delta) =
                                v["choices"][0]["delta"]["content"].as_str()
                            {
                                if !delta.is_empty() {
                                    out.push(Ok(delta.to_string()));
                                }
                            }
                        }
                    }
                }
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(deltas))
    }
}

/// Build the request body in the OpenAI chat-completions shape.
pub(crate) fn build_body(req: &ChatRequest, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if !req.system.is_empty() {
        messages.push(json!({ "role": "system", "content": req.system }));
    }
    for m in &req.messages {
        messages.push(message_to_wire(m));
    }

    let mut body = json!({
        "model": req.api_name,
        "messages": messages,
        "stream": stream,
    });
    if let Some(t) = req.params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.params.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(mt) = req.params.max_tokens {
        body["max_tokens"] = json!(mt);
    }
    if let Some(rp) = req.params.repetition_penalty {
        body["presence_penalty"] = json!(penalty_to_additive(rp));
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

fn message_to_wire(m: &ChatMessage) -> Value {
    match m.role {
        Role::System => json!({ "role": "system", "content": m.content }),
        Role::User => json!({ "role": "user", "content": m.content }),
        Role::Assistant if !m.tool_calls.is_empty() => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
            json!({ "role": "assistant", "content": Value::Null, "tool_calls": calls })
        }
        Role::Assistant => {
            let mut v = json!({ "role": "assistant", "content": m.content });
            // The wire `name` field must match ^[a-zA-Z0-9_-]+$.
            if let Some(agent) = &m.agent {
                v["name"] = json!(sanitize_name(agent));
            }
            v
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
    }
}

/// Map the multiplicative repetition penalty to the additive wire value:
/// `1.0` is neutral and maps to `0`, anything else to `penalty − 1`.
pub(crate) fn penalty_to_additive(penalty: f32) -> f32 {
    if (penalty - 1.0).abs() < f32::EPSILON {
        0.0
    } else {
        penalty - 1.0
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get("retry-after")?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

/// Parse a non-streaming chat-completions response into normalized form.
pub(crate) fn parse_response(provider: &str, v: &Value) -> Result<ChatResponse, ProviderError> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(ProviderError::Unexpected {
            provider: provider.to_string(),
            message: format!("response has no choices: {v}"),
        });
    }

    let content = message["content"].as_str().unwrap_or("").to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for c in calls {
            let arguments = c["function"]["arguments"]
                .as_str()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(json!({}));
            tool_calls.push(ToolCall {
                id: c["id"].as_str().unwrap_or_default().to_string(),
                name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments,
            });
        }
    }

    let usage = Usage::new(
        v["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        v["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    );

    Ok(ChatResponse {
        content,
        usage,
        tool_calls,
        model: v["model"].as_str().unwrap_or("").to_string(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SamplingParams;

    fn req() -> ChatRequest {
        ChatRequest {
            api_name: "gpt-4o".into(),
            messages: vec![ChatMessage::user("hi")],
            system: "be terse".into(),
            params: SamplingParams::default(),
            tools: vec![],
        }
    }

    // ── Body building ─────────────────────────────────────────────────────────

    #[test]
    fn system_prompt_becomes_leading_system_message() {
        let body = build_body(&req(), false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be terse");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn empty_system_prompt_is_omitted() {
        let mut r = req();
        r.system.clear();
        let body = build_body(&r, false);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn sampling_params_are_forwarded_when_set() {
        let mut r = req();
        r.params = SamplingParams {
            temperature: Some(0.3),
            top_p: Some(0.9),
            max_tokens: Some(256),
            repetition_penalty: Some(1.2),
        };
        let body = build_body(&r, false);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["top_p"], 0.9);
        assert_eq!(body["max_tokens"], 256);
        let pp = body["presence_penalty"].as_f64().unwrap();
        assert!((pp - 0.2).abs() < 1e-6, "presence_penalty = {pp}");
    }

    #[test]
    fn unset_params_are_absent_from_body() {
        let body = build_body(&req(), false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("presence_penalty").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn neutral_penalty_maps_to_zero() {
        assert_eq!(penalty_to_additive(1.0), 0.0);
        assert!((penalty_to_additive(1.5) - 0.5).abs() < 1e-6);
        assert!((penalty_to_additive(0.8) + 0.2).abs() < 1e-6);
    }

    #[test]
    fn agent_tag_becomes_sanitized_name_field() {
        let mut r = req();
        r.messages = vec![ChatMessage::assistant_from("Dr. Who?", "hello")];
        let body = build_body(&r, false);
        assert_eq!(body["messages"][1]["name"], "Dr__Who_");
    }

    #[test]
    fn tool_schema_uses_function_wrapper() {
        let mut r = req();
        r.tools = vec![crate::ToolSchema {
            name: "lookup".into(),
            description: "find things".into(),
            parameters: json!({ "type": "object" }),
        }];
        let body = build_body(&r, false);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
    }

    #[test]
    fn assistant_tool_calls_are_echoed_with_string_arguments() {
        let mut r = req();
        r.messages = vec![ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "call-1".into(),
            name: "lookup".into(),
            arguments: json!({ "q": "rust" }),
        }])];
        let body = build_body(&r, false);
        let wire = &body["messages"][1];
        assert_eq!(wire["tool_calls"][0]["id"], "call-1");
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let mut r = req();
        r.messages = vec![ChatMessage::tool_result("call-1", "42")];
        let body = build_body(&r, false);
        let wire = &body["messages"][1];
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call-1");
    }

    // ── Response parsing ──────────────────────────────────────────────────────

    #[test]
    fn parse_plain_text_response() {
        let v = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        });
        let r = parse_response("openai", &v).unwrap();
        assert_eq!(r.content, "hello");
        assert_eq!(r.usage.total_tokens, 15);
        assert_eq!(r.model, "gpt-4o-2024-08-06");
        assert!(!r.wants_tools());
    }

    #[test]
    fn parse_tool_call_response() {
        let v = json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": { "name": "lookup", "arguments": "{\"q\":\"rust\"}" }
                }]
            }}],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        });
        let r = parse_response("openai", &v).unwrap();
        assert!(r.wants_tools());
        assert_eq!(r.tool_calls[0].id, "call_9");
        assert_eq!(r.tool_calls[0].name, "lookup");
        assert_eq!(r.tool_calls[0].arguments["q"], "rust");
        assert_eq!(r.content, "");
    }

    #[test]
    fn parse_malformed_arguments_fall_back_to_empty_object() {
        let v = json!({
            "choices": [{ "message": {
                "tool_calls": [{ "id": "c", "function": { "name": "f", "arguments": "{oops" } }]
            }}]
        });
        let r = parse_response("openai", &v).unwrap();
        assert_eq!(r.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn parse_response_without_choices_is_unexpected() {
        let v = json!({ "object": "error" });
        let e = parse_response("openai", &v).unwrap_err();
        assert_eq!(e.kind(), "unknown");
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "12".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }
}

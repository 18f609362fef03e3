// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    adapter::DeltaStream, openai_compat::parse_retry_after, ChatAdapter, ChatRequest,
    ChatResponse, ProviderError, Role, ToolCall, Usage,
};

pub struct AnthropicAdapter {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

const DEFAULT_MAX_TOKENS: u32 = 4096;

impl AnthropicAdapter {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Authentication {
                provider: "anthropic".into(),
                message: "no API key configured".into(),
            })?;

        debug!(url = %self.base_url, "sending anthropic request");
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::transport("anthropic", e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                "anthropic",
                status.as_u16(),
                &text,
                retry_after,
            ));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatAdapter for AnthropicAdapter {
    fn provider(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_body(req, false);
        let resp = self.send(&body).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::transport("anthropic", e))?;
        parse_response(&v)
    }

    async fn complete_streaming(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let body = build_body(req, true);
        let resp = self.send(&body).await?;

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks; carry a remainder buffer.
        let deltas = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        let err = ProviderError::Transport {
                            provider: "anthropic".into(),
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
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            if v["type"] == "content_block_delta"
                                && v["delta"]["type"] == "text_delta"
                            {
                                if let Some(t) = v["delta"]["text"].as_str() {
                                    if !t.is_empty() {
                                        out.push(Ok(t.to_string()));
                                    }
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

/// Build the Messages-API request body.
///
/// The system prompt goes in the dedicated top-level `system` field, never
/// as a conversation turn.  Tool results become `tool_result` blocks on a
/// user turn, matching what the API expects after a `tool_use` turn.
pub(crate) fn build_body(req: &ChatRequest, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    let mut system_text = req.system.clone();

    for m in &req.messages {
        match m.role {
            // A leading session-level system turn folds into the system field.
            Role::System => {
                if system_text.is_empty() {
                    system_text = m.content.clone();
                } else {
                    system_text.push_str("\n\n");
                    system_text.push_str(&m.content);
                }
            }
            Role::User => messages.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let blocks: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "type": "tool_use",
                            "id": c.id,
                            "name": c.name,
                            "input": c.arguments,
                        })
                    })
                    .collect();
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Assistant => {
                // No wire slot for the producing agent; fold the tag into the
                // text so multi-agent transcripts stay attributable.
                let content = match &m.agent {
                    Some(a) => format!("[{a}] {}", m.content),
                    None => m.content.clone(),
                };
                messages.push(json!({ "role": "assistant", "content": content }));
            }
            Role::Tool => messages.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content,
                }]
            })),
        }
    }

    let mut body = json!({
        "model": req.api_name,
        "messages": messages,
        "max_tokens": req.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "stream": stream,
    });
    if !system_text.is_empty() {
        body["system"] = json!(system_text);
    }
    if let Some(t) = req.params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.params.top_p {
        body["top_p"] = json!(p);
    }
    // The Messages API has no repetition-penalty parameter; the normalized
    // value is intentionally not forwarded.
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

pub(crate) fn parse_response(v: &Value) -> Result<ChatResponse, ProviderError> {
    let blocks = v["content"].as_array().ok_or_else(|| ProviderError::Unexpected {
        provider: "anthropic".into(),
        message: format!("response has no content array: {v}"),
    })?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str().unwrap_or("") {
            "text" => content.push_str(block["text"].as_str().unwrap_or("")),
            "tool_use" => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    let usage = Usage::new(
        v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    );

    Ok(ChatResponse {
        content,
        usage,
        tool_calls,
        model: v["model"].as_str().unwrap_or("").to_string(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

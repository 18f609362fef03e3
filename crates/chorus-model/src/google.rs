// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini adapter — native Generative Language API.
//!
//! Uses the `generateContent` / `streamGenerateContent` endpoints.
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent`

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    adapter::DeltaStream, ChatAdapter, ChatRequest, ChatResponse, ProviderError, Role, ToolCall,
    Usage,
};

pub struct GoogleAdapter {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleAdapter {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, req: &ChatRequest, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Authentication {
                provider: "google".into(),
                message: "no API key configured".into(),
            })?;

        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/v1beta/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            req.api_name,
            method,
        );
        let body = build_body(req);

        debug!(model = %req.api_name, "sending google request");
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transport("google", e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = crate::openai_compat::parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                "google",
                status.as_u16(),
                &text,
                retry_after,
            ));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatAdapter for GoogleAdapter {
    fn provider(&self) -> &str {
        "google"
    }

    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let resp = self.send(req, false).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::transport("google", e))?;
        parse_response(req, &v)
    }

    async fn complete_streaming(&self, req: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let resp = self.send(req, true).await?;

        let byte_stream = resp.bytes_stream();
        let deltas = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        let err = ProviderError::Transport {
                            provider: "google".into(),
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
                            if let Some(t) =
                                v["candidates"][0]["content"]["parts"][0]["text"].as_str()
                            {
                                if !t.is_empty() {
                                    out.push(Ok(t.to_string()));
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

/// Build the Generative Language request body.
///
/// Gemini matches function responses to calls by *name*, not id, so tool
/// turns are resolved through an id → name map built from the assistant
/// tool-call turns earlier in the sequence.
pub(crate) fn build_body(req: &ChatRequest) -> Value {
    let mut call_names: HashMap<String, String> = HashMap::new();
    for m in &req.messages {
        for c in &m.tool_calls {
            call_names.insert(c.id.clone(), c.name.clone());
        }
    }

    let mut system_text = req.system.clone();
    let mut contents: Vec<Value> = Vec::new();

    for m in &req.messages {
        match m.role {
            Role::System => {
                if system_text.is_empty() {
                    system_text = m.content.clone();
                } else {
                    system_text.push_str("\n\n");
                    system_text.push_str(&m.content);
                }
            }
            Role::User => contents.push(json!({
                "role": "user",
                "parts": [{ "text": m.content }],
            })),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let parts: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({ "functionCall": { "name": c.name, "args": c.arguments } })
                    })
                    .collect();
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            Role::Assistant => {
                let text = match &m.agent {
                    Some(a) => format!("[{a}] {}", m.content),
                    None => m.content.clone(),
                };
                contents.push(json!({ "role": "model", "parts": [{ "text": text }] }));
            }
            Role::Tool => {
                let id = m.tool_call_id.clone().unwrap_or_default();
                let name = call_names.get(&id).cloned().unwrap_or(id);
                let response: Value = serde_json::from_str(&m.content)
                    .unwrap_or_else(|_| json!({ "result": m.content }));
                contents.push(json!({
                    "role": "user",
                    "parts": [{ "functionResponse": { "name": name, "response": response } }],
                }));
            }
        }
    }

    let mut generation_config = json!({});
    if let Some(t) = req.params.temperature {
        generation_config["temperature"] = json!(t);
    }
    if let Some(p) = req.params.top_p {
        generation_config["topP"] = json!(p);
    }
    if let Some(mt) = req.params.max_tokens {
        generation_config["maxOutputTokens"] = json!(mt);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if !system_text.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system_text }] });
    }
    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

/// Parse a `generateContent` response.  Function-call parts have no id on
/// this wire, so stable ids are synthesized from the call position.
pub(crate) fn parse_response(req: &ChatRequest, v: &Value) -> Result<ChatResponse, ProviderError> {
    let parts = v["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| ProviderError::Unexpected {
            provider: "google".into(),
            message: format!("response has no candidate parts: {v}"),
        })?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(t) = part["text"].as_str() {
            content.push_str(t);
        } else if let Some(fc) = part.get("functionCall") {
            let name = fc["name"].as_str().unwrap_or_default().to_string();
            tool_calls.push(ToolCall {
                id: format!("call-{}-{}", name, tool_calls.len()),
                name,
                arguments: fc["args"].clone(),
            });
        }
    }

    let usage = Usage::new(
        v["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        v["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    );

    Ok(ChatResponse {
        content,
        usage,
        tool_calls,
        model: req.api_name.clone(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

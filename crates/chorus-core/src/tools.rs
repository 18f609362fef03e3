// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chorus_model::{ChatMessage, ToolCall, ToolSchema};
use serde_json::{json, Value};
use tracing::warn;

use crate::CoreError;

/// One invocable tool.  Execution is delegated entirely to the handler; the
/// negotiator adds no side effects of its own.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;
    async fn invoke(&self, arguments: &Value) -> Result<Value, String>;
}

/// Static tool registry plus the archetype allow-list.
///
/// Agents advertise tools filtered by their archetype; an archetype with no
/// allow-list entry gets no tools, and `None` (no archetype) gets the full
/// registry.
#[derive(Default)]
pub struct ToolNegotiator {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    allow: HashMap<String, Vec<String>>,
}

impl ToolNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl ToolHandler + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Permit `tools` for agents of `archetype`.
    pub fn allow(&mut self, archetype: impl Into<String>, tools: &[&str]) {
        self.allow
            .insert(archetype.into(), tools.iter().map(|s| s.to_string()).collect());
    }

    /// Tool schemas an agent of `archetype` may use, sorted by name.
    pub fn advertise(&self, archetype: Option<&str>) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| match archetype {
                None => true,
                Some(a) => self
                    .allow
                    .get(a)
                    .map(|names| names.iter().any(|n| n == t.name()))
                    .unwrap_or(false),
            })
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Invoke a registered tool.
    ///
    /// Unknown tools are a [`CoreError::Validation`].  Handler failures are
    /// not errors at this level — the model needs to see them — so they come
    /// back as an `{"error": ...}` result object.
    pub async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, CoreError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(CoreError::Validation(format!("unknown tool: {name}")));
        };
        match tool.invoke(arguments).await {
            Ok(v) => Ok(v),
            Err(msg) => {
                warn!(tool = name, error = %msg, "tool handler failed");
                Ok(json!({ "error": msg }))
            }
        }
    }

    /// Build the tool-role turn that answers `call`.
    pub fn result_message(call: &ToolCall, result: &Value) -> ChatMessage {
        let content = match result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ChatMessage::tool_result(&call.id, content)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }
        async fn invoke(&self, arguments: &Value) -> Result<Value, String> {
            Ok(json!({ "echo": arguments["text"] }))
        }
    }

    struct Broken;

    #[async_trait]
    impl ToolHandler for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn invoke(&self, _arguments: &Value) -> Result<Value, String> {
            Err("it broke".into())
        }
    }

    fn negotiator() -> ToolNegotiator {
        let mut n = ToolNegotiator::new();
        n.register(Echo);
        n.register(Broken);
        n.allow("researcher", &["echo"]);
        n
    }

    #[test]
    fn advertise_without_archetype_returns_all_sorted() {
        let n = negotiator();
        let schemas = n.advertise(None);
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["broken", "echo"]);
    }

    #[test]
    fn advertise_filters_by_archetype_allow_list() {
        let n = negotiator();
        let names: Vec<String> = n
            .advertise(Some("researcher"))
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["echo"]);
        assert!(n.advertise(Some("unlisted")).is_empty());
    }

    #[tokio::test]
    async fn invoke_runs_registered_handler() {
        let n = negotiator();
        let out = n.invoke("echo", &json!({ "text": "hi" })).await.unwrap();
        assert_eq!(out["echo"], "hi");
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_validation_error() {
        let n = negotiator();
        let err = n.invoke("nope", &json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn handler_failure_surfaces_as_error_object() {
        let n = negotiator();
        let out = n.invoke("broken", &json!({})).await.unwrap();
        assert_eq!(out["error"], "it broke");
    }

    #[test]
    fn result_message_references_the_call() {
        let call = ToolCall {
            id: "call-3".into(),
            name: "echo".into(),
            arguments: json!({}),
        };
        let msg = ToolNegotiator::result_message(&call, &json!({ "ok": true }));
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-3"));
        assert!(msg.content.contains("ok"));
    }
}

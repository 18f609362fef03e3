use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single turn in a conversation.
///
/// Invariants maintained by the callers that build sequences:
/// - at most one leading [`Role::System`] message;
/// - assistant turns carry `agent` when several agents share one sequence;
/// - tool turns always reference a previously emitted tool-call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Producing agent, for assistant turns in multi-agent sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// For tool turns: id of the tool call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For assistant turns that requested tool invocations: the calls, so
    /// adapters can echo them back in the provider's wire shape.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    /// Assistant turn tagged with the producing agent's name.
    pub fn assistant_from(agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            ..Self::plain(Role::Assistant, text)
        }
    }

    /// Assistant turn that carries tool-call requests (echoed to providers
    /// when round-tripping tool results).
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, "")
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            agent: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Approximate token count using the 4-chars-per-token heuristic.
    pub fn approx_tokens(&self) -> usize {
        let call_chars: usize = self
            .tool_calls
            .iter()
            .map(|c| c.name.len() + c.arguments.to_string().len())
            .sum();
        ((self.content.len() + call_chars) / 4).max(1)
    }
}

// ─── Tooling ──────────────────────────────────────────────────────────────────

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// A normalized tool-call request parsed from a provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Structured argument object (already parsed from the wire).
    pub arguments: serde_json::Value,
}

// ─── Request / response ───────────────────────────────────────────────────────

/// Sampling parameters forwarded to the provider.  All optional; adapters
/// substitute provider defaults for `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Multiplicative repetition penalty.  A value of `1.0` is neutral:
    /// adapters translate it to an additive penalty of `0`, and any other
    /// value to `penalty − 1`.
    pub repetition_penalty: Option<f32>,
}

/// Normalized request handed to a [`crate::ChatAdapter`].
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier on the provider's wire (the registry `api_name`).
    pub api_name: String,
    pub messages: Vec<ChatMessage>,
    /// System prompt; empty string means none.  Adapters place it in the
    /// provider's correct slot (inline system role vs. dedicated field).
    pub system: String,
    pub params: SamplingParams,
    pub tools: Vec<ToolSchema>,
}

impl ChatRequest {
    /// Approximate prompt size in tokens (messages + system prompt).
    pub fn approx_tokens(&self) -> usize {
        let msg_tokens: usize = self.messages.iter().map(|m| m.approx_tokens()).sum();
        msg_tokens + (self.system.len() / 4)
    }
}

/// Token usage from one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    /// Accumulate another call's usage (tool round-trips make two calls).
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Normalized response returned by a [`crate::ChatAdapter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Usage,
    /// Tool calls requested by the model; empty when the turn is final.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Model identifier reported by the provider (api name).
    pub model: String,
}

impl ChatResponse {
    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "hello");
        assert!(m.agent.is_none());
    }

    #[test]
    fn assistant_from_tags_the_agent() {
        let m = ChatMessage::assistant_from("Critic", "I disagree");
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.agent.as_deref(), Some("Critic"));
    }

    #[test]
    fn tool_result_references_call_id() {
        let m = ChatMessage::tool_result("call-7", "42");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-7"));
    }

    #[test]
    fn approx_tokens_divides_by_four_with_floor_of_one() {
        assert_eq!(ChatMessage::user("12345678").approx_tokens(), 2);
        assert_eq!(ChatMessage::user("hi").approx_tokens(), 1);
        assert_eq!(ChatMessage::user("").approx_tokens(), 1);
    }

    #[test]
    fn request_tokens_include_system_prompt() {
        let req = ChatRequest {
            system: "x".repeat(40),
            messages: vec![ChatMessage::user("12345678")],
            ..Default::default()
        };
        assert_eq!(req.approx_tokens(), 2 + 10);
    }

    #[test]
    fn usage_accumulates_across_calls() {
        let mut u = Usage::new(10, 5);
        u.add(Usage::new(3, 2));
        assert_eq!(u.prompt_tokens, 13);
        assert_eq!(u.completion_tokens, 7);
        assert_eq!(u.total_tokens, 20);
    }

    #[test]
    fn message_serialises_without_empty_optionals() {
        let json = serde_json::to_string(&ChatMessage::user("t")).unwrap();
        assert!(!json.contains("agent"));
        assert!(!json.contains("tool_call"));
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = ChatMessage::assistant_from("A", "text");
        let back: ChatMessage = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert_eq!(back.agent.as_deref(), Some("A"));
        assert_eq!(back.content, "text");
    }
}

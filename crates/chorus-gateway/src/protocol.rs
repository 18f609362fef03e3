// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire protocol for the client channel: JSON text frames over WebSocket.
//!
//! Client envelopes are tagged with `type`; server events likewise.  The
//! event names are part of the public contract (`agent_response`,
//! `chat_complete`, `conversation-start`, ...) and must not drift.

use std::collections::HashMap;
use std::str::FromStr;

use chorus_core::{
    AgentRef, AgentSpec, CoreError, OrchestrationSettings, OrchestratorEvent, Strategy,
};
use chorus_model::SamplingParams;
use serde::{Deserialize, Serialize};

// ─── Client → server ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    Chat { payload: ChatPayload },
    StartConversation { payload: StartConversationPayload },
    GetStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub session_id: String,
    pub agents: Vec<AgentSpec>,
    pub message: String,
    #[serde(default)]
    pub settings: SettingsPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPayload {
    pub orchestration_strategy: Option<String>,
    pub enable_tools: Option<bool>,
    pub break_on_error: Option<bool>,
    pub pipeline_continue_on_error: Option<bool>,
    pub consensus_threshold: Option<f64>,
    pub competitive_timeout_ms: Option<u64>,
    /// Per-agent model overrides keyed by agent id.
    #[serde(default)]
    pub agent_models: HashMap<String, String>,
    #[serde(default)]
    pub agent_parameters: HashMap<String, SamplingParams>,
    #[serde(default)]
    pub agent_api_keys: HashMap<String, String>,
}

impl SettingsPayload {
    /// Decode into orchestration settings; an unknown strategy string is a
    /// validation failure.
    pub fn decode(self) -> Result<OrchestrationSettings, CoreError> {
        let strategy = match &self.orchestration_strategy {
            None => None,
            Some(s) => Some(Strategy::from_str(s).map_err(CoreError::Validation)?),
        };
        Ok(OrchestrationSettings {
            strategy,
            enable_tools: self.enable_tools.unwrap_or(false),
            break_on_error: self.break_on_error.unwrap_or(false),
            pipeline_continue_on_error: self.pipeline_continue_on_error.unwrap_or(false),
            consensus_threshold: self.consensus_threshold,
            competitive_timeout_ms: self.competitive_timeout_ms,
            agent_models: self.agent_models,
            agent_params: self.agent_parameters,
            agent_api_keys: self.agent_api_keys,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationPayload {
    pub session_id: String,
    #[serde(default)]
    pub topic: Option<String>,
    pub agents: Vec<AgentSpec>,
}

// ─── Server → client ──────────────────────────────────────────────────────────

/// Gateway-level events (connection lifecycle, status, terminal errors).
/// Orchestration events are serialized from [`OrchestratorEvent`] directly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_reconnection: Option<bool>,
        agents: Vec<String>,
    },
    #[serde(rename = "conversation-start", rename_all = "camelCase")]
    ConversationStart {
        session_id: String,
        agents: Vec<AgentRef>,
    },
    #[serde(rename = "status", rename_all = "camelCase")]
    Status {
        agents: usize,
        active_conversations: usize,
        connected_clients: usize,
        uptime_seconds: u64,
    },
    #[serde(rename = "error")]
    Error { error: String, recoverable: bool },
}

/// Everything that can travel down a client's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Gateway(ServerEvent),
    Orchestration(OrchestratorEvent),
}

impl Outbound {
    pub fn to_json(&self) -> Option<String> {
        match self {
            Self::Gateway(ev) => serde_json::to_string(ev).ok(),
            Self::Orchestration(ev) => serde_json::to_string(ev).ok(),
        }
    }

    /// Droppable events go first under backpressure.
    pub fn droppable(&self) -> bool {
        match self {
            Self::Gateway(ServerEvent::Status { .. }) => true,
            Self::Gateway(_) => false,
            Self::Orchestration(ev) => ev.droppable(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_envelope_parses() {
        let text = json!({
            "type": "chat",
            "payload": {
                "sessionId": "s1",
                "agents": [
                    { "id": "a1", "name": "Scout", "provider": "openai", "model": "gpt-4o" }
                ],
                "message": "hello",
                "settings": { "orchestrationStrategy": "parallel", "enableTools": true }
            }
        })
        .to_string();
        let env: ClientEnvelope = serde_json::from_str(&text).unwrap();
        let ClientEnvelope::Chat { payload } = env else {
            panic!("wrong envelope variant")
        };
        assert_eq!(payload.session_id, "s1");
        assert_eq!(payload.agents[0].name, "Scout");
        let settings = payload.settings.decode().unwrap();
        assert_eq!(settings.strategy, Some(Strategy::Parallel));
        assert!(settings.enable_tools);
    }

    #[test]
    fn chat_settings_default_when_absent() {
        let text = json!({
            "type": "chat",
            "payload": { "sessionId": "s1", "agents": [], "message": "hi" }
        })
        .to_string();
        let env: ClientEnvelope = serde_json::from_str(&text).unwrap();
        let ClientEnvelope::Chat { payload } = env else {
            panic!("wrong envelope variant")
        };
        let settings = payload.settings.decode().unwrap();
        assert_eq!(settings.strategy, None);
        assert!(!settings.enable_tools);
    }

    #[test]
    fn unknown_strategy_is_a_validation_error() {
        let payload = SettingsPayload {
            orchestration_strategy: Some("roundrobin".into()),
            ..Default::default()
        };
        let err = payload.decode().unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(err.to_string().contains("roundrobin"));
    }

    #[test]
    fn start_conversation_envelope_parses() {
        let text = json!({
            "type": "start-conversation",
            "payload": { "sessionId": "s2", "topic": "rust", "agents": [] }
        })
        .to_string();
        let env: ClientEnvelope = serde_json::from_str(&text).unwrap();
        assert!(matches!(env, ClientEnvelope::StartConversation { .. }));
    }

    #[test]
    fn get_status_envelope_parses() {
        let env: ClientEnvelope = serde_json::from_str(r#"{"type":"get-status"}"#).unwrap();
        assert!(matches!(env, ClientEnvelope::GetStatus));
    }

    #[test]
    fn unknown_envelope_type_fails_to_parse() {
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn connected_event_uses_camel_case_fields() {
        let ev = ServerEvent::Connected {
            user_id: "u1".into(),
            is_reconnection: Some(true),
            agents: vec!["a1".into()],
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "connected");
        assert_eq!(v["userId"], "u1");
        assert_eq!(v["isReconnection"], true);
    }

    #[test]
    fn conversation_start_uses_kebab_type() {
        let ev = ServerEvent::ConversationStart {
            session_id: "s1".into(),
            agents: vec![],
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "conversation-start");
        assert_eq!(v["sessionId"], "s1");
    }

    #[test]
    fn status_events_are_droppable_errors_are_not() {
        let status = Outbound::Gateway(ServerEvent::Status {
            agents: 0,
            active_conversations: 0,
            connected_clients: 1,
            uptime_seconds: 3,
        });
        assert!(status.droppable());
        let error = Outbound::Gateway(ServerEvent::Error {
            error: "x".into(),
            recoverable: true,
        });
        assert!(!error.droppable());
    }
}

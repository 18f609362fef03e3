// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::str::FromStr;

use chorus_model::{ToolCall, Usage};
use serde::{Deserialize, Serialize};

/// Coordination mode for one user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Parallel,
    Sequential,
    Pipeline,
    Competitive,
    Consensus,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "pipeline" => Ok(Self::Pipeline),
            "competitive" => Ok(Self::Competitive),
            "consensus" => Ok(Self::Consensus),
            other => Err(format!("unknown orchestration strategy: {other:?}")),
        }
    }
}

/// Agent identity carried on wire events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

/// One pipeline stage as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub agent: AgentRef,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events emitted by the orchestrator during one dispatch.  The gateway
/// forwards them to the owning connection in emission order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentResponse {
        agent: AgentRef,
        response: String,
        response_time_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    AgentResponseError {
        agent: AgentRef,
        error: String,
    },
    PipelineResult {
        pipeline: Vec<StageReport>,
        final_output: String,
    },
    ConsensusResult {
        reached: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        points: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        divergent_points: Option<Vec<String>>,
        agreement_level: f64,
    },
    /// A model fallback was taken for an agent call.  Informational;
    /// droppable under backpressure.
    ModelFallback {
        agent: AgentRef,
        from: String,
        to: String,
    },
    ChatComplete {
        strategy: Strategy,
    },
}

impl OrchestratorEvent {
    /// Events the gateway may drop when a client's queue is full.
    /// `chat_complete` and per-agent results are never dropped.
    pub fn droppable(&self) -> bool {
        matches!(self, Self::ModelFallback { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_all_known_names() {
        for (s, v) in [
            ("parallel", Strategy::Parallel),
            ("sequential", Strategy::Sequential),
            ("pipeline", Strategy::Pipeline),
            ("competitive", Strategy::Competitive),
            ("consensus", Strategy::Consensus),
        ] {
            assert_eq!(s.parse::<Strategy>().unwrap(), v);
        }
        assert!("roundrobin".parse::<Strategy>().is_err());
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let ev = OrchestratorEvent::ChatComplete {
            strategy: Strategy::Parallel,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "chat_complete");
        assert_eq!(v["strategy"], "parallel");
    }

    #[test]
    fn agent_response_omits_empty_optionals() {
        let ev = OrchestratorEvent::AgentResponse {
            agent: AgentRef {
                id: "a1".into(),
                name: "A".into(),
            },
            response: "hi".into(),
            response_time_ms: 5,
            usage: None,
            tool_calls: vec![],
        };
        let text = serde_json::to_string(&ev).unwrap();
        assert!(!text.contains("usage"));
        assert!(!text.contains("tool_calls"));
    }

    #[test]
    fn only_fallback_events_are_droppable() {
        let fallback = OrchestratorEvent::ModelFallback {
            agent: AgentRef { id: "a".into(), name: "A".into() },
            from: "m1".into(),
            to: "m2".into(),
        };
        assert!(fallback.droppable());
        let complete = OrchestratorEvent::ChatComplete { strategy: Strategy::Consensus };
        assert!(!complete.droppable());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System-prompt assembly.
//!
//! The final prompt for an agent is the concatenation of the collective
//! prompt (shared across agents, filled from Meta and Conversation memory),
//! an optional scenario template picked per turn by the orchestrator, and
//! the agent's individual prompt (filled from its Model Memory).  Unfilled
//! placeholders are stripped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::CoreError;

const MAX_PROMPT_CHARS: usize = 10_000;

const COLLECTIVE_TEMPLATE: &str = "\
You are part of a team of AI agents collaborating on the user's request.

User context: {{userContext}}
Current goals: {{currentGoals}}
Shared knowledge: {{sharedKnowledge}}
Session context: {{sessionContext}}";

const INDIVIDUAL_TEMPLATE: &str = "\
You are {{agentName}}, acting as {{role}}.
Expertise: {{expertise}}
Style: {{style}}
Personality: {{personalityTraits}}
Preferences: {{preferences}}
Emotional state: {{emotionalState}}
{{specialInstructions}}";

/// Scenario templates selectable per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Consensus,
    Creativity,
    Analysis,
    Learning,
    Collaboration,
}

impl Scenario {
    fn template(self) -> &'static str {
        match self {
            Self::Consensus => {
                "The team is working toward consensus. State your position in clear, \
                 complete sentences and explicitly note where you agree with others."
            }
            Self::Creativity => {
                "Favor original, unexpected angles over safe answers. One strong idea \
                 beats three weak ones."
            }
            Self::Analysis => {
                "Break the problem into parts, examine each carefully, and make your \
                 reasoning explicit."
            }
            Self::Learning => {
                "Explain concepts step by step, check understanding, and build on what \
                 the user already knows."
            }
            Self::Collaboration => {
                "Build on the other agents' contributions rather than repeating them; \
                 attribute ideas you extend."
            }
        }
    }
}

/// Values substituted into the templates.  Empty strings mean "not
/// available" and cause the placeholder to be stripped.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub user_context: String,
    pub current_goals: String,
    pub shared_knowledge: String,
    pub session_context: String,
    pub agent_name: String,
    pub role: String,
    pub expertise: String,
    pub style: String,
    pub personality_traits: String,
    pub preferences: String,
    pub emotional_state: String,
    pub special_instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub version: u64,
    pub at: DateTime<Utc>,
    pub prompt: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AssemblerState {
    version: u64,
    /// Append-only prompt history per agent id.
    history: HashMap<String, Vec<PromptRecord>>,
}

#[derive(Default)]
pub struct PromptAssembler {
    state: Mutex<AssemblerState>,
}

impl PromptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble the final system prompt for one agent and record it in the
    /// agent's history.
    pub fn assemble(
        &self,
        agent_id: &str,
        scenario: Option<Scenario>,
        ctx: &PromptContext,
    ) -> String {
        let mut parts = Vec::with_capacity(3);
        parts.push(substitute(COLLECTIVE_TEMPLATE, ctx));
        if let Some(s) = scenario {
            parts.push(s.template().to_string());
        }
        parts.push(substitute(INDIVIDUAL_TEMPLATE, ctx));
        let prompt = parts.join("\n\n");

        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let record = PromptRecord {
            version: state.version,
            at: Utc::now(),
            prompt: prompt.clone(),
        };
        state.history.entry(agent_id.to_string()).or_default().push(record);
        prompt
    }

    /// Reject prompts that are oversized or still carry placeholders.
    pub fn validate(prompt: &str) -> Result<(), CoreError> {
        if prompt.len() > MAX_PROMPT_CHARS {
            return Err(CoreError::Validation(format!(
                "prompt is {} chars, maximum is {MAX_PROMPT_CHARS}",
                prompt.len()
            )));
        }
        if let Some(found) = placeholder_re().find(prompt) {
            return Err(CoreError::Validation(format!(
                "prompt contains unfilled placeholder {}",
                found.as_str()
            )));
        }
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    pub fn history(&self, agent_id: &str) -> Vec<PromptRecord> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Serializable view for the persistence layer.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        serde_json::to_value(&*state).unwrap_or_default()
    }

    /// Restore a snapshot written by [`PromptAssembler::snapshot`].
    pub fn restore(&self, snapshot: serde_json::Value) {
        if let Ok(restored) = serde_json::from_value::<AssemblerState>(snapshot) {
            *self.state.lock().unwrap() = restored;
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\w+\}\}").expect("static regex"))
}

/// Fill a template: known placeholders get their value, anything left
/// (unknown or empty value) is stripped.  Lines reduced to a bare label are
/// dropped entirely.
fn substitute(template: &str, ctx: &PromptContext) -> String {
    let pairs: [(&str, &str); 12] = [
        ("{{userContext}}", &ctx.user_context),
        ("{{currentGoals}}", &ctx.current_goals),
        ("{{sharedKnowledge}}", &ctx.shared_knowledge),
        ("{{sessionContext}}", &ctx.session_context),
        ("{{agentName}}", &ctx.agent_name),
        ("{{role}}", &ctx.role),
        ("{{expertise}}", &ctx.expertise),
        ("{{style}}", &ctx.style),
        ("{{personalityTraits}}", &ctx.personality_traits),
        ("{{preferences}}", &ctx.preferences),
        ("{{emotionalState}}", &ctx.emotional_state),
        ("{{specialInstructions}}", &ctx.special_instructions),
    ];

    let mut out = template.to_string();
    for (placeholder, value) in pairs {
        out = out.replace(placeholder, value);
    }
    // Strip placeholders this context does not know about.
    out = placeholder_re().replace_all(&out, "").to_string();

    // Drop lines whose substitution left only a label ("Expertise:").
    out.lines()
        .filter(|line| !line.trim_end().ends_with(':'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn full_ctx() -> PromptContext {
        PromptContext {
            user_context: "works on infra".into(),
            current_goals: "ship v1".into(),
            shared_knowledge: "the api is rate limited".into(),
            session_context: "discussing deploys".into(),
            agent_name: "Scout".into(),
            role: "researcher".into(),
            expertise: "distributed systems".into(),
            style: "concise".into(),
            personality_traits: "curious".into(),
            preferences: "examples first".into(),
            emotional_state: "satisfaction=0.5".into(),
            special_instructions: "cite sources".into(),
        }
    }

    #[test]
    fn assemble_orders_collective_scenario_individual() {
        let a = PromptAssembler::new();
        let prompt = a.assemble("a1", Some(Scenario::Consensus), &full_ctx());
        let collective = prompt.find("team of AI agents").unwrap();
        let scenario = prompt.find("working toward consensus").unwrap();
        let individual = prompt.find("You are Scout").unwrap();
        assert!(collective < scenario && scenario < individual);
    }

    #[test]
    fn assemble_without_scenario_omits_it() {
        let a = PromptAssembler::new();
        let prompt = a.assemble("a1", None, &full_ctx());
        assert!(!prompt.contains("consensus"));
        assert!(prompt.contains("You are Scout"));
    }

    #[test]
    fn unfilled_placeholders_are_stripped() {
        let a = PromptAssembler::new();
        let prompt = a.assemble("a1", None, &PromptContext::default());
        assert!(!prompt.contains("{{"), "residual placeholder in: {prompt}");
        assert!(!prompt.contains("}}"));
    }

    #[test]
    fn empty_value_drops_the_labeled_line() {
        let a = PromptAssembler::new();
        let mut ctx = full_ctx();
        ctx.expertise.clear();
        let prompt = a.assemble("a1", None, &ctx);
        assert!(!prompt.contains("Expertise:"));
        assert!(prompt.contains("Style: concise"));
    }

    #[test]
    fn version_increments_and_history_appends() {
        let a = PromptAssembler::new();
        assert_eq!(a.version(), 0);
        a.assemble("a1", None, &full_ctx());
        a.assemble("a1", None, &full_ctx());
        a.assemble("a2", None, &full_ctx());
        assert_eq!(a.version(), 3);
        let h = a.history("a1");
        assert_eq!(h.len(), 2);
        assert_eq!(h[0].version, 1);
        assert_eq!(h[1].version, 2);
        assert_eq!(a.history("a2").len(), 1);
        assert!(a.history("missing").is_empty());
    }

    #[test]
    fn validate_rejects_oversized_prompts() {
        let big = "x".repeat(MAX_PROMPT_CHARS + 1);
        assert!(matches!(
            PromptAssembler::validate(&big),
            Err(CoreError::Validation(_))
        ));
        assert!(PromptAssembler::validate("fine").is_ok());
    }

    #[test]
    fn validate_rejects_residual_placeholders() {
        let err = PromptAssembler::validate("hello {{agentName}}").unwrap_err();
        assert!(err.to_string().contains("{{agentName}}"));
    }

    #[test]
    fn snapshot_restore_round_trips_history() {
        let a = PromptAssembler::new();
        a.assemble("a1", None, &full_ctx());
        let snap = a.snapshot();
        let b = PromptAssembler::new();
        b.restore(snap);
        assert_eq!(b.version(), 1);
        assert_eq!(b.history("a1").len(), 1);
    }
}

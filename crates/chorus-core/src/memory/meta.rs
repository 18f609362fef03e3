// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide shared memory: the user profile, collaboration goals with
//! progress, shared understanding (facts, concepts, decisions, principles),
//! and the effectiveness EMA.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::clamp01;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// Patch merged into the user profile: preferences and context shallow-merge,
/// goals and highlights append.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GoalScope {
    ShortTerm,
    LongTerm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub text: String,
    pub scope: GoalScope,
    /// Percent complete, clamped to `[0, 100]`.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFact {
    pub confidence: f64,
    pub sources: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub definition: String,
    pub examples: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub text: String,
    pub participants: Vec<String>,
    pub reasoning: String,
    pub at: DateTime<Utc>,
}

/// Inputs for one effectiveness update, each in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct EffectivenessInputs {
    pub consensus_rate: f64,
    pub goal_progress: f64,
    pub participation_balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaMemory {
    #[serde(default)]
    pub user_profile: UserProfile,
    #[serde(default)]
    pub short_term_goals: Vec<Goal>,
    #[serde(default)]
    pub long_term_goals: Vec<Goal>,
    #[serde(default)]
    pub completed_goals: Vec<Goal>,
    #[serde(default)]
    pub facts: HashMap<String, SharedFact>,
    #[serde(default)]
    pub concepts: HashMap<String, Concept>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub principles: Vec<String>,
    /// Exponential moving average of collaboration effectiveness.
    pub effectiveness: f64,
}

impl Default for MetaMemory {
    fn default() -> Self {
        Self {
            user_profile: UserProfile::default(),
            short_term_goals: Vec::new(),
            long_term_goals: Vec::new(),
            completed_goals: Vec::new(),
            facts: HashMap::new(),
            concepts: HashMap::new(),
            decisions: Vec::new(),
            principles: Vec::new(),
            effectiveness: 0.5,
        }
    }
}

impl MetaMemory {
    pub fn update_user_profile(&mut self, patch: ProfilePatch) {
        self.user_profile.preferences.extend(patch.preferences);
        self.user_profile.goals.extend(patch.goals);
        self.user_profile.highlights.extend(patch.highlights);
        self.user_profile.context.extend(patch.context);
    }

    /// Register a collaboration goal; returns its id.
    pub fn add_goal(&mut self, text: impl Into<String>, scope: GoalScope) -> String {
        let goal = Goal {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            scope,
            progress: 0.0,
            created_at: Utc::now(),
            completed_at: None,
        };
        let id = goal.id.clone();
        match scope {
            GoalScope::ShortTerm => self.short_term_goals.push(goal),
            GoalScope::LongTerm => self.long_term_goals.push(goal),
        }
        id
    }

    /// Set a goal's progress (clamped to `[0, 100]`).  At 100 the goal is
    /// stamped complete and moved out of its active list.  Returns false
    /// for unknown ids.
    pub fn update_goal_progress(&mut self, id: &str, percent: f64) -> bool {
        let percent = percent.clamp(0.0, 100.0);

        for list in [&mut self.short_term_goals, &mut self.long_term_goals] {
            if let Some(pos) = list.iter().position(|g| g.id == id) {
                if percent >= 100.0 {
                    let mut goal = list.remove(pos);
                    goal.progress = 100.0;
                    goal.completed_at = Some(Utc::now());
                    self.completed_goals.push(goal);
                } else {
                    list[pos].progress = percent;
                }
                return true;
            }
        }
        false
    }

    pub fn goal_progress(&self, id: &str) -> Option<f64> {
        self.short_term_goals
            .iter()
            .chain(&self.long_term_goals)
            .chain(&self.completed_goals)
            .find(|g| g.id == id)
            .map(|g| g.progress)
    }

    pub fn add_shared_fact(
        &mut self,
        text: impl Into<String>,
        confidence: f64,
        sources: Vec<String>,
    ) {
        self.facts.insert(
            text.into(),
            SharedFact {
                confidence: clamp01(confidence),
                sources,
                at: Utc::now(),
            },
        );
    }

    pub fn add_shared_concept(
        &mut self,
        name: impl Into<String>,
        definition: impl Into<String>,
        examples: Vec<String>,
    ) {
        self.concepts.insert(
            name.into(),
            Concept {
                definition: definition.into(),
                examples,
                at: Utc::now(),
            },
        );
    }

    pub fn add_decision(
        &mut self,
        text: impl Into<String>,
        participants: Vec<String>,
        reasoning: impl Into<String>,
    ) {
        self.decisions.push(Decision {
            text: text.into(),
            participants,
            reasoning: reasoning.into(),
            at: Utc::now(),
        });
    }

    pub fn add_principle(&mut self, text: impl Into<String>) {
        self.principles.push(text.into());
    }

    /// Blend one observation into the effectiveness EMA:
    /// `score = 0.3·consensus + 0.4·goals + 0.3·balance`, then
    /// `eff ← 0.7·eff + 0.3·score`.
    pub fn update_effectiveness(&mut self, inputs: EffectivenessInputs) {
        let score = 0.3 * clamp01(inputs.consensus_rate)
            + 0.4 * clamp01(inputs.goal_progress)
            + 0.3 * clamp01(inputs.participation_balance);
        self.effectiveness = clamp01(0.7 * self.effectiveness + 0.3 * score);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_patch_merges_and_appends() {
        let mut m = MetaMemory::default();
        m.update_user_profile(ProfilePatch {
            preferences: [("tone".to_string(), json!("direct"))].into(),
            goals: vec!["learn rust".into()],
            highlights: vec!["likes examples".into()],
            context: [("tz".to_string(), json!("UTC"))].into(),
        });
        m.update_user_profile(ProfilePatch {
            preferences: [("tone".to_string(), json!("casual"))].into(),
            goals: vec!["ship project".into()],
            ..Default::default()
        });
        assert_eq!(m.user_profile.preferences["tone"], "casual");
        assert_eq!(m.user_profile.goals.len(), 2);
        assert_eq!(m.user_profile.highlights.len(), 1);
        assert_eq!(m.user_profile.context["tz"], "UTC");
    }

    #[test]
    fn add_goal_starts_at_zero_progress() {
        let mut m = MetaMemory::default();
        let id = m.add_goal("write tests", GoalScope::ShortTerm);
        assert_eq!(m.goal_progress(&id), Some(0.0));
        assert_eq!(m.short_term_goals.len(), 1);
    }

    #[test]
    fn progress_is_clamped() {
        let mut m = MetaMemory::default();
        let id = m.add_goal("g", GoalScope::LongTerm);
        assert!(m.update_goal_progress(&id, -20.0));
        assert_eq!(m.goal_progress(&id), Some(0.0));
        assert!(m.update_goal_progress(&id, 55.5));
        assert_eq!(m.goal_progress(&id), Some(55.5));
    }

    #[test]
    fn completing_a_goal_moves_it_and_stamps_it() {
        let mut m = MetaMemory::default();
        let id = m.add_goal("finish", GoalScope::ShortTerm);
        assert!(m.update_goal_progress(&id, 130.0));
        assert!(m.short_term_goals.is_empty());
        assert_eq!(m.completed_goals.len(), 1);
        let done = &m.completed_goals[0];
        assert_eq!(done.progress, 100.0);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn unknown_goal_id_is_rejected() {
        let mut m = MetaMemory::default();
        assert!(!m.update_goal_progress("nope", 50.0));
    }

    #[test]
    fn shared_knowledge_is_append_only_with_timestamps() {
        let mut m = MetaMemory::default();
        m.add_shared_fact("the sky is blue", 0.9, vec!["a1".into()]);
        m.add_shared_concept("idempotency", "same result on retry", vec!["PUT".into()]);
        m.add_decision("use rust", vec!["a1".into(), "a2".into()], "performance");
        m.add_principle("prefer clarity");
        assert!(m.facts.contains_key("the sky is blue"));
        assert_eq!(m.concepts["idempotency"].definition, "same result on retry");
        assert_eq!(m.decisions.len(), 1);
        assert_eq!(m.principles, ["prefer clarity"]);
    }

    #[test]
    fn fact_confidence_is_clamped() {
        let mut m = MetaMemory::default();
        m.add_shared_fact("f", 3.0, vec![]);
        assert_eq!(m.facts["f"].confidence, 1.0);
    }

    #[test]
    fn effectiveness_blends_weighted_score_into_ema() {
        let mut m = MetaMemory::default();
        assert_eq!(m.effectiveness, 0.5);
        m.update_effectiveness(EffectivenessInputs {
            consensus_rate: 1.0,
            goal_progress: 1.0,
            participation_balance: 1.0,
        });
        // 0.7 * 0.5 + 0.3 * 1.0 = 0.65
        assert!((m.effectiveness - 0.65).abs() < 1e-12);
        m.update_effectiveness(EffectivenessInputs {
            consensus_rate: 0.0,
            goal_progress: 0.0,
            participation_balance: 0.0,
        });
        // 0.7 * 0.65 = 0.455
        assert!((m.effectiveness - 0.455).abs() < 1e-12);
    }

    #[test]
    fn serde_round_trip_is_structurally_equal() {
        let mut m = MetaMemory::default();
        let id = m.add_goal("g", GoalScope::ShortTerm);
        m.update_goal_progress(&id, 40.0);
        m.add_shared_fact("f", 0.8, vec!["src".into()]);
        let json = serde_json::to_string(&m).unwrap();
        let back: MetaMemory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.goal_progress(&id), Some(40.0));
        assert_eq!(back.facts["f"].sources, ["src"]);
        assert_eq!(back.effectiveness, m.effectiveness);
    }
}

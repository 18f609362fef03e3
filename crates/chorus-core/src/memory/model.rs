// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-agent memory: personality traits, preferences, skills, an emotion
//! map, and a Q-learning table that lets reinforcement shape behavior over
//! time.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator for flattened `(state, action)` Q-table keys, so the
/// serialized table stays a flat JSON map.
const Q_KEY_SEP: char = '\u{1f}';

pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitEntry {
    pub value: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub value: String,
    pub strength: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinforcementEntry {
    pub action: String,
    /// Magnitude of the reward or punishment (always positive).
    pub magnitude: f64,
    pub state: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMemory {
    #[serde(default)]
    pub traits: HashMap<String, TraitEntry>,
    #[serde(default)]
    pub preferences: HashMap<String, Preference>,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub emotions: HashMap<String, f64>,
    #[serde(default)]
    q_table: HashMap<String, f64>,
    #[serde(default)]
    pub reward_log: Vec<ReinforcementEntry>,
    #[serde(default)]
    pub punishment_log: Vec<ReinforcementEntry>,
    #[serde(default)]
    pub structured_memory: Vec<serde_json::Value>,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
}

impl Default for ModelMemory {
    fn default() -> Self {
        Self {
            traits: HashMap::new(),
            preferences: HashMap::new(),
            skills: BTreeSet::new(),
            emotions: HashMap::new(),
            q_table: HashMap::new(),
            reward_log: Vec::new(),
            punishment_log: Vec::new(),
            structured_memory: Vec::new(),
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.1,
        }
    }
}

impl ModelMemory {
    pub fn add_trait(&mut self, name: impl Into<String>, value: impl Into<String>, confidence: f64) {
        self.traits.insert(
            name.into(),
            TraitEntry {
                value: value.into(),
                confidence: clamp01(confidence),
            },
        );
    }

    /// Create or strengthen a preference.  Strength moves by
    /// `strength_delta` and stays clamped to `[0, 1]`.
    pub fn add_preference(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        strength_delta: f64,
        context: Option<String>,
    ) {
        let name = name.into();
        let value = value.into();
        let entry = self.preferences.entry(name).or_insert(Preference {
            value: value.clone(),
            strength: 0.0,
            context: context.clone(),
        });
        entry.value = value;
        entry.strength = clamp01(entry.strength + strength_delta);
        if context.is_some() {
            entry.context = context;
        }
    }

    pub fn add_skill(&mut self, name: impl Into<String>) {
        self.skills.insert(name.into());
    }

    pub fn q(&self, state: &str, action: &str) -> f64 {
        self.q_table
            .get(&q_key(state, action))
            .copied()
            .unwrap_or(0.0)
    }

    fn max_q_for_state(&self, state: &str) -> f64 {
        let prefix = format!("{state}{Q_KEY_SEP}");
        self.q_table
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| *v)
            .fold(0.0, f64::max)
    }

    /// Apply one reinforcement signal.
    ///
    /// Logs the event, strengthens a referenced preference, performs the
    /// Q-learning update
    /// `Q[s,a] ← Q[s,a] + α·(r + γ·max_a' Q[s,a'] − Q[s,a])`,
    /// and adjusts the emotion map: satisfaction or frustration is boosted
    /// by `0.5·|r|`, every other emotion decays by ×0.95.
    pub fn apply_reinforcement(&mut self, action: &str, reward: f64, state: &str) {
        let entry = ReinforcementEntry {
            action: action.to_string(),
            magnitude: reward.abs(),
            state: state.to_string(),
            at: Utc::now(),
        };
        if reward > 0.0 {
            self.reward_log.push(entry);
        } else {
            self.punishment_log.push(entry);
        }

        if self.preferences.contains_key(action) {
            let delta = reward * self.learning_rate;
            if let Some(p) = self.preferences.get_mut(action) {
                p.strength = clamp01(p.strength + delta);
            }
        }

        // max over a' is read before the write so a fresh (state, action)
        // pair sees max_next_q = 0 and lands on exactly α·r.
        let max_next_q = self.max_q_for_state(state);
        let key = q_key(state, action);
        let old = self.q_table.get(&key).copied().unwrap_or(0.0);
        let updated =
            old + self.learning_rate * (reward + self.discount_factor * max_next_q - old);
        self.q_table.insert(key, updated);

        let boosted = if reward > 0.0 { "satisfaction" } else { "frustration" };
        let boost = 0.5 * reward.abs();
        for (name, intensity) in self.emotions.iter_mut() {
            if name != boosted {
                *intensity *= 0.95;
            }
        }
        let current = self.emotions.entry(boosted.to_string()).or_insert(0.0);
        *current = clamp01(*current + boost);
    }

    /// Epsilon-greedy action selection: explore uniformly with probability
    /// `exploration_rate`, otherwise pick the argmax Q value (first listed
    /// wins ties).
    pub fn select_action(&self, state: &str, available: &[String]) -> Option<String> {
        self.select_action_with(state, available, rand::random::<f64>(), |n| {
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..n)
        })
    }

    /// Deterministic core of [`ModelMemory::select_action`], split out so
    /// tests can pin the random draws.
    pub fn select_action_with(
        &self,
        state: &str,
        available: &[String],
        explore_draw: f64,
        pick_uniform: impl FnOnce(usize) -> usize,
    ) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        if explore_draw < self.exploration_rate {
            return Some(available[pick_uniform(available.len())].clone());
        }
        let mut best = &available[0];
        let mut best_q = self.q(state, best);
        for action in &available[1..] {
            let q = self.q(state, action);
            if q > best_q {
                best = action;
                best_q = q;
            }
        }
        Some(best.clone())
    }

    pub fn add_structured(&mut self, entry: serde_json::Value) {
        self.structured_memory.push(entry);
    }

    /// Tagged textual summary of personality, emotions and learning state,
    /// for the prompt assembler's `{{personalityTraits}}` family of slots.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        if !self.traits.is_empty() {
            let mut traits: Vec<_> = self.traits.iter().collect();
            traits.sort_by(|a, b| a.0.cmp(b.0));
            out.push_str("[traits] ");
            for (i, (name, t)) in traits.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format!("{name}={} ({:.2})", t.value, t.confidence));
            }
            out.push('\n');
        }

        if !self.preferences.is_empty() {
            let mut prefs: Vec<_> = self.preferences.iter().collect();
            prefs.sort_by(|a, b| a.0.cmp(b.0));
            out.push_str("[preferences] ");
            for (i, (name, p)) in prefs.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format!("{name}={} ({:.2})", p.value, p.strength));
            }
            out.push('\n');
        }

        if !self.skills.is_empty() {
            out.push_str("[skills] ");
            out.push_str(&self.skills.iter().cloned().collect::<Vec<_>>().join(", "));
            out.push('\n');
        }

        if !self.emotions.is_empty() {
            let mut emotions: Vec<_> = self.emotions.iter().collect();
            emotions.sort_by(|a, b| a.0.cmp(b.0));
            out.push_str("[emotions] ");
            for (i, (name, v)) in emotions.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format!("{name}={v:.2}"));
            }
            out.push('\n');
        }

        out.push_str(&format!(
            "[learning] q_entries={} rewards={} punishments={}",
            self.q_table.len(),
            self.reward_log.len(),
            self.punishment_log.len(),
        ));
        out
    }

    /// Bound the unbounded logs before persisting.
    pub fn truncate_for_save(&mut self, keep_logs: usize, keep_structured: usize) {
        truncate_front(&mut self.reward_log, keep_logs);
        truncate_front(&mut self.punishment_log, keep_logs);
        truncate_front(&mut self.structured_memory, keep_structured);
    }
}

fn q_key(state: &str, action: &str) -> String {
    format!("{state}{Q_KEY_SEP}{action}")
}

fn truncate_front<T>(v: &mut Vec<T>, keep: usize) {
    if v.len() > keep {
        v.drain(..v.len() - keep);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

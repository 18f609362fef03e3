// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session conversation memory: timeline, per-participant stats, topic
//! frequency tracking, and the avoided-topic set that keeps a conversation
//! from circling the same ground.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::OnceLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Context-window entries kept per session.
const CONTEXT_WINDOW_CAP: usize = 20;
/// A topic mentioned more than this many times is a candidate for avoidance.
const AVOID_COUNT_THRESHOLD: u32 = 5;
/// Depth a topic must exceed to be avoided.
const AVOID_DEPTH_THRESHOLD: f64 = 3.0;
/// Mention count beyond which `should_avoid_topic` warns even before the
/// topic lands in the avoid set.
const SOFT_AVOID_COUNT: u32 = 3;
/// Depth gained per mention, capped at 5.
const DEPTH_STEP: f64 = 0.2;
const DEPTH_CAP: f64 = 5.0;
/// Keywords whose following token is extracted as a topic.
const TOPIC_KEYWORDS: &[&str] = &["about", "regarding", "discuss", "discussing", "explore", "exploring"];
/// How recent a topic's last mention must be for `get_context`.
const RECENT_TOPIC_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub agent_id: String,
    pub text: String,
    pub topics: Vec<String>,
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantStats {
    pub message_count: u64,
    pub topics: BTreeSet<String>,
    pub hashtags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicStats {
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub depth: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub timeline: Vec<TimelineEntry>,
    pub participants: HashMap<String, ParticipantStats>,
    pub topics: HashMap<String, TopicStats>,
    context_window: VecDeque<TimelineEntry>,
    /// Cumulative for the session: topics never leave this set.
    avoided_topics: BTreeSet<String>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Snapshot returned by [`ConversationMemory::get_context`].
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub window: Vec<TimelineEntry>,
    /// Topics mentioned in the last five minutes.
    pub recent_topics: Vec<String>,
    pub avoided_topics: Vec<String>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one message: extract topics and hashtags, update participant
    /// and topic stats, append to the timeline and the bounded context
    /// window, then fold newly overexposed topics into the avoid set.
    pub fn add_message(&mut self, agent_id: &str, text: &str) {
        let now = Utc::now();
        let hashtags = extract_hashtags(text);
        let topics = extract_topics(text);

        let entry = TimelineEntry {
            at: now,
            agent_id: agent_id.to_string(),
            text: text.to_string(),
            topics: topics.clone(),
            hashtags: hashtags.clone(),
        };

        let stats = self.participants.entry(agent_id.to_string()).or_default();
        stats.message_count += 1;
        stats.topics.extend(topics.iter().cloned());
        stats.hashtags.extend(hashtags.iter().cloned());

        for topic in &topics {
            let t = self.topics.entry(topic.clone()).or_insert(TopicStats {
                count: 0,
                first_seen: now,
                last_seen: now,
                depth: 0.0,
            });
            t.count += 1;
            t.last_seen = now;
            t.depth = (t.depth + DEPTH_STEP).min(DEPTH_CAP);
        }

        self.timeline.push(entry.clone());
        self.context_window.push_back(entry);
        while self.context_window.len() > CONTEXT_WINDOW_CAP {
            self.context_window.pop_front();
        }
        self.last_active = Some(now);

        for (topic, t) in &self.topics {
            if t.count > AVOID_COUNT_THRESHOLD && t.depth > AVOID_DEPTH_THRESHOLD {
                self.avoided_topics.insert(topic.clone());
            }
        }
    }

    /// True when the topic is in the avoid set, or has simply been mentioned
    /// often enough to steer away from.
    pub fn should_avoid_topic(&self, topic: &str) -> bool {
        if self.avoided_topics.contains(topic) {
            return true;
        }
        self.topics
            .get(topic)
            .map(|t| t.count > SOFT_AVOID_COUNT)
            .unwrap_or(false)
    }

    pub fn avoided_topics(&self) -> impl Iterator<Item = &str> {
        self.avoided_topics.iter().map(String::as_str)
    }

    /// The last `limit` window entries, recently active topics, and the
    /// avoid set.
    pub fn get_context(&self, limit: usize) -> ContextSnapshot {
        let start = self.context_window.len().saturating_sub(limit);
        let window: Vec<TimelineEntry> =
            self.context_window.iter().skip(start).cloned().collect();

        let cutoff = Utc::now() - ChronoDuration::seconds(RECENT_TOPIC_WINDOW_SECS);
        let mut recent_topics: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, t)| t.last_seen >= cutoff)
            .map(|(name, _)| name.clone())
            .collect();
        recent_topics.sort();

        ContextSnapshot {
            window,
            recent_topics,
            avoided_topics: self.avoided_topics.iter().cloned().collect(),
        }
    }

    pub fn context_window_len(&self) -> usize {
        self.context_window.len()
    }
}

fn hashtag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#(\w+)").expect("static regex"))
}

fn capitalized_bigram_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z][a-z]+)\s+([A-Z][a-z]+)\b").expect("static regex"))
}

pub(crate) fn extract_hashtags(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for cap in hashtag_re().captures_iter(text) {
        let tag = cap[1].to_lowercase();
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Topics are lower-cased tokens following a keyword ("about X", "discuss
/// X"), plus capitalized bigrams normalized with underscores
/// ("Machine Learning" → "machine_learning").
pub(crate) fn extract_topics(text: &str) -> Vec<String> {
    let mut out = Vec::new();

    let words: Vec<&str> = text.split_whitespace().collect();
    for pair in words.windows(2) {
        let keyword = pair[0].to_lowercase();
        if TOPIC_KEYWORDS.contains(&keyword.as_str()) {
            let topic: String = pair[1]
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if topic.len() > 2 && !out.contains(&topic) {
                out.push(topic);
            }
        }
    }

    for cap in capitalized_bigram_re().captures_iter(text) {
        let topic = format!("{}_{}", cap[1].to_lowercase(), cap[2].to_lowercase());
        if !out.contains(&topic) {
            out.push(topic);
        }
    }

    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

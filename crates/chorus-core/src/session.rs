// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chorus_model::{ChatMessage, SamplingParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One participant in a session: identity, model binding, prompt seed and
/// sampling parameters.  Immutable after session start; the per-turn system
/// prompt is derived outside this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub params: SamplingParams,
    /// Tool allow-list archetype (see the tool negotiator).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<String>,
}

impl AgentSpec {
    pub fn agent_ref(&self) -> crate::AgentRef {
        crate::AgentRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// One conversation between a user identity and a set of agents.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub participants: Vec<AgentSpec>,
    pub turns: Vec<ChatMessage>,
    pub started_at: DateTime<Utc>,
    last_active: Instant,
}

impl Session {
    fn new(id: String, participants: Vec<AgentSpec>) -> Self {
        Self {
            id,
            participants,
            turns: Vec::new(),
            started_at: Utc::now(),
            last_active: Instant::now(),
        }
    }

    pub fn push(&mut self, msg: ChatMessage) {
        self.turns.push(msg);
        self.last_active = Instant::now();
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

/// Sessions by id.  The per-session `tokio::sync::Mutex` doubles as the
/// session lock: holding it across an orchestration serializes chats within
/// that session without blocking other sessions.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
    idle_expiry: Duration,
}

impl SessionStore {
    pub fn new(idle_expiry: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_expiry,
        }
    }

    /// Fetch an existing session or create it on first use.  An existing
    /// session keeps its original participant set.
    pub fn get_or_create(
        &self,
        session_id: &str,
        participants: &[AgentSpec],
    ) -> Arc<tokio::sync::Mutex<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Session::new(
                    session_id.to_string(),
                    participants.to_vec(),
                )))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<tokio::sync::Mutex<Session>>> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn close(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().remove(session_id).is_some()
    }

    /// Drop sessions idle past the expiry.  Returns the ids removed so the
    /// caller can free the attached conversation memory.
    pub fn expire_idle(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut removed = Vec::new();
        sessions.retain(|id, s| {
            let keep = match s.try_lock() {
                Ok(guard) => guard.idle_for() < self.idle_expiry,
                // In use right now, so clearly not idle.
                Err(_) => true,
            };
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentSpec {
        AgentSpec {
            id: id.into(),
            name: id.to_uppercase(),
            provider: "mock".into(),
            model: "mock-model".into(),
            system_prompt: None,
            params: SamplingParams::default(),
            archetype: None,
        }
    }

    #[tokio::test]
    async fn get_or_create_returns_same_session() {
        let store = SessionStore::new(Duration::from_secs(60));
        let a = store.get_or_create("s1", &[agent("a")]);
        let b = store.get_or_create("s1", &[agent("b")]);
        assert!(Arc::ptr_eq(&a, &b));
        // Original participants are kept.
        assert_eq!(a.lock().await.participants[0].id, "a");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn push_appends_turns_in_order() {
        let store = SessionStore::new(Duration::from_secs(60));
        let s = store.get_or_create("s1", &[agent("a")]);
        let mut guard = s.lock().await;
        guard.push(ChatMessage::user("one"));
        guard.push(ChatMessage::assistant_from("A", "two"));
        assert_eq!(guard.turns.len(), 2);
        assert_eq!(guard.turns[1].agent.as_deref(), Some("A"));
    }

    #[test]
    fn close_removes_the_session() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.get_or_create("s1", &[]);
        assert!(store.close("s1"));
        assert!(!store.close("s1"));
        assert!(store.is_empty());
    }

    #[test]
    fn expire_idle_removes_stale_sessions() {
        let store = SessionStore::new(Duration::from_millis(1));
        store.get_or_create("old", &[]);
        std::thread::sleep(Duration::from_millis(10));
        let removed = store.expire_idle();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(store.is_empty());
    }

    #[test]
    fn expire_idle_keeps_fresh_sessions() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.get_or_create("fresh", &[]);
        assert!(store.expire_idle().is_empty());
        assert_eq!(store.len(), 1);
    }
}

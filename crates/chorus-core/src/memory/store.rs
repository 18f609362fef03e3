// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ownership and persistence for the three memory tiers.
//!
//! The store owns every [`ModelMemory`] (per agent), [`ConversationMemory`]
//! (per session) and the process-wide [`MetaMemory`]; callers get at them
//! through closure-based handles so mutations always happen under the
//! tier's own lock and never across an await point.
//!
//! Persistence is four JSON documents in the configured directory, read on
//! init and written by the periodic autosave task and on graceful shutdown.
//! Last-write-wins; no transactional semantics are assumed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use chorus_config::MemoryConfig;

use super::conversation::ConversationMemory;
use super::meta::MetaMemory;
use super::model::ModelMemory;
use crate::prompt::PromptAssembler;

const MODEL_FILE: &str = "model-memories.json";
const CONVERSATION_FILE: &str = "conversation-memories.json";
const META_FILE: &str = "meta-memory.json";
const PROMPTS_FILE: &str = "prompts.json";

pub struct MemoryStore {
    cfg: MemoryConfig,
    models: RwLock<HashMap<String, ModelMemory>>,
    conversations: RwLock<HashMap<String, ConversationMemory>>,
    meta: RwLock<MetaMemory>,
}

impl MemoryStore {
    /// Empty store, no persistence directory consulted.
    pub fn new(cfg: MemoryConfig) -> Self {
        Self {
            cfg,
            models: RwLock::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            meta: RwLock::new(MetaMemory::default()),
        }
    }

    /// Load persisted state from the configured directory.  Missing or
    /// unreadable documents fall back to defaults with a warning — a
    /// corrupt file must not keep the process from starting.
    pub fn load(cfg: MemoryConfig, prompts: &PromptAssembler) -> Self {
        let store = Self::new(cfg);
        let Some(dir) = store.dir() else {
            return store;
        };

        if let Some(models) = read_doc::<HashMap<String, ModelMemory>>(&dir.join(MODEL_FILE)) {
            *store.models.write().unwrap() = models;
        }
        if let Some(convs) =
            read_doc::<HashMap<String, ConversationMemory>>(&dir.join(CONVERSATION_FILE))
        {
            *store.conversations.write().unwrap() = convs;
        }
        if let Some(meta) = read_doc::<MetaMemory>(&dir.join(META_FILE)) {
            *store.meta.write().unwrap() = meta;
        }
        if let Some(snapshot) = read_doc::<serde_json::Value>(&dir.join(PROMPTS_FILE)) {
            prompts.restore(snapshot);
        }
        info!(dir = %dir.display(), "memory store loaded");
        store
    }

    fn dir(&self) -> Option<PathBuf> {
        self.cfg.dir.as_ref().map(PathBuf::from)
    }

    // ── Model memory ──────────────────────────────────────────────────────────

    /// Mutate (creating on first use) the model memory of one agent.
    pub fn with_model<R>(&self, agent_id: &str, f: impl FnOnce(&mut ModelMemory) -> R) -> R {
        let mut models = self.models.write().unwrap();
        f(models.entry(agent_id.to_string()).or_default())
    }

    pub fn read_model<R>(&self, agent_id: &str, f: impl FnOnce(Option<&ModelMemory>) -> R) -> R {
        let models = self.models.read().unwrap();
        f(models.get(agent_id))
    }

    // ── Conversation memory ───────────────────────────────────────────────────

    pub fn with_conversation<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut ConversationMemory) -> R,
    ) -> R {
        let mut convs = self.conversations.write().unwrap();
        f(convs.entry(session_id.to_string()).or_default())
    }

    pub fn read_conversation<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(Option<&ConversationMemory>) -> R,
    ) -> R {
        let convs = self.conversations.read().unwrap();
        f(convs.get(session_id))
    }

    /// Free a session's conversation memory (session destroyed).
    pub fn drop_conversation(&self, session_id: &str) {
        self.conversations.write().unwrap().remove(session_id);
    }

    // ── Meta memory ───────────────────────────────────────────────────────────

    pub fn with_meta<R>(&self, f: impl FnOnce(&mut MetaMemory) -> R) -> R {
        f(&mut self.meta.write().unwrap())
    }

    pub fn read_meta<R>(&self, f: impl FnOnce(&MetaMemory) -> R) -> R {
        f(&self.meta.read().unwrap())
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Write all four documents.  No-op when no directory is configured.
    pub fn save(&self, prompts: &PromptAssembler) -> anyhow::Result<()> {
        let Some(dir) = self.dir() else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating memory dir {}", dir.display()))?;

        // Bounded logs are truncated on the serialized copy only; the live
        // in-process memory keeps its full logs.
        let models: HashMap<String, ModelMemory> = {
            let guard = self.models.read().unwrap();
            guard
                .iter()
                .map(|(k, v)| {
                    let mut m = v.clone();
                    m.truncate_for_save(
                        self.cfg.keep_log_entries,
                        self.cfg.keep_structured_entries,
                    );
                    (k.clone(), m)
                })
                .collect()
        };
        write_doc(&dir.join(MODEL_FILE), &models)?;

        // Keep only the most recently active sessions on disk.
        let conversations: HashMap<String, ConversationMemory> = {
            let guard = self.conversations.read().unwrap();
            let mut entries: Vec<(&String, &ConversationMemory)> = guard.iter().collect();
            entries.sort_by(|a, b| b.1.last_active.cmp(&a.1.last_active));
            entries
                .into_iter()
                .take(self.cfg.keep_sessions)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        write_doc(&dir.join(CONVERSATION_FILE), &conversations)?;

        write_doc(&dir.join(META_FILE), &*self.meta.read().unwrap())?;
        write_doc(&dir.join(PROMPTS_FILE), &prompts.snapshot())?;

        debug!(dir = %dir.display(), "memory store saved");
        Ok(())
    }

    /// Periodic auto-save until the handle is aborted.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        prompts: Arc<PromptAssembler>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let period = Duration::from_secs(self.cfg.autosave_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.save(&prompts) {
                    warn!(error = %e, "memory autosave failed");
                }
            }
        })
    }
}

fn read_doc<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.is_file() {
        return None;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read memory document");
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse memory document");
            None
        }
    }
}

fn write_doc<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::meta::GoalScope;

    fn cfg(dir: Option<String>) -> MemoryConfig {
        MemoryConfig {
            dir,
            autosave_interval_secs: 60,
            keep_sessions: 2,
            keep_log_entries: 10,
            keep_structured_entries: 10,
        }
    }

    #[test]
    fn model_handle_creates_on_first_use() {
        let store = MemoryStore::new(cfg(None));
        store.with_model("a1", |m| m.add_skill("rust"));
        let has = store.read_model("a1", |m| m.map(|m| m.skills.contains("rust")));
        assert_eq!(has, Some(true));
        assert_eq!(store.read_model("missing", |m| m.is_some()), false);
    }

    #[test]
    fn conversation_handles_are_per_session() {
        let store = MemoryStore::new(cfg(None));
        store.with_conversation("s1", |c| c.add_message("a1", "about rust"));
        store.with_conversation("s2", |c| c.add_message("a1", "about golang"));
        let t1 = store.read_conversation("s1", |c| c.unwrap().topics.contains_key("rust"));
        assert!(t1);
        store.drop_conversation("s1");
        assert!(store.read_conversation("s1", |c| c.is_none()));
        assert!(store.read_conversation("s2", |c| c.is_some()));
    }

    #[test]
    fn save_without_dir_is_a_noop() {
        let store = MemoryStore::new(cfg(None));
        let prompts = PromptAssembler::new();
        store.save(&prompts).unwrap();
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let prompts = PromptAssembler::new();

        let store = MemoryStore::new(cfg(Some(path.clone())));
        store.with_model("a1", |m| {
            m.add_trait("curious", "high", 0.8);
            m.apply_reinforcement("act", 1.0, "state");
        });
        store.with_conversation("s1", |c| c.add_message("a1", "about rust"));
        let goal_id = store.with_meta(|m| m.add_goal("ship", GoalScope::ShortTerm));
        prompts.assemble("a1", None, &crate::prompt::PromptContext::default());
        store.save(&prompts).unwrap();

        let prompts2 = PromptAssembler::new();
        let loaded = MemoryStore::load(cfg(Some(path)), &prompts2);
        let q = loaded.read_model("a1", |m| m.unwrap().q("state", "act"));
        assert!(q > 0.0, "q-table survived the round trip");
        assert!(loaded.read_conversation("s1", |c| c.unwrap().topics.contains_key("rust")));
        assert_eq!(loaded.read_meta(|m| m.goal_progress(&goal_id)), Some(0.0));
        assert_eq!(prompts2.version(), 1);
    }

    #[test]
    fn save_trims_to_most_recent_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let store = MemoryStore::new(cfg(Some(path.clone())));
        for s in ["s1", "s2", "s3"] {
            store.with_conversation(s, |c| c.add_message("a1", "hello there"));
            std::thread::sleep(Duration::from_millis(5));
        }
        store.save(&PromptAssembler::new()).unwrap();

        let loaded = MemoryStore::load(cfg(Some(path)), &PromptAssembler::new());
        // keep_sessions = 2: the oldest session is gone.
        assert!(loaded.read_conversation("s1", |c| c.is_none()));
        assert!(loaded.read_conversation("s2", |c| c.is_some()));
        assert!(loaded.read_conversation("s3", |c| c.is_some()));
    }

    #[test]
    fn save_truncates_model_logs_but_keeps_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let store = MemoryStore::new(cfg(Some(path.clone())));
        store.with_model("a1", |m| {
            for i in 0..25 {
                m.apply_reinforcement(&format!("a{i}"), 1.0, "s");
            }
        });
        store.save(&PromptAssembler::new()).unwrap();

        // Live memory untouched.
        assert_eq!(store.read_model("a1", |m| m.unwrap().reward_log.len()), 25);
        // Persisted copy truncated to keep_log_entries = 10.
        let loaded = MemoryStore::load(cfg(Some(path)), &PromptAssembler::new());
        assert_eq!(loaded.read_model("a1", |m| m.unwrap().reward_log.len()), 10);
    }

    #[test]
    fn corrupt_document_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(META_FILE), "{not json").unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let loaded = MemoryStore::load(cfg(Some(path)), &PromptAssembler::new());
        assert_eq!(loaded.read_meta(|m| m.effectiveness), 0.5);
    }
}

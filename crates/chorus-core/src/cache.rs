// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Response cache keyed by a canonical request fingerprint.
//!
//! The fingerprint covers exactly `(model, [(role, content)...],
//! temperature, top_p, max_tokens)` — never nonces, agent tags, user ids or
//! timestamps — so identical requests hit regardless of how the maps were
//! assembled.  Eviction is LRU at capacity; expiry is lazy on read plus a
//! periodic sweep.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chorus_config::CacheConfig;
use chorus_model::{ChatMessage, ChatResponse, SamplingParams};
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;

struct Entry {
    response: ChatResponse,
    inserted_at: Instant,
}

struct Inner {
    map: LruCache<String, Entry>,
    hits: u64,
    misses: u64,
}

pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_size.max(1)).expect("clamped above");
        Self {
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            inner: Mutex::new(Inner {
                map: LruCache::new(cap),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Deterministic fingerprint of the cache-relevant request fields.
    ///
    /// Floats are rendered with fixed precision and fields in a fixed order,
    /// so representation and insertion order cannot perturb the digest.
    pub fn fingerprint(model: &str, messages: &[ChatMessage], params: &SamplingParams) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0x1e]);
        for m in messages {
            hasher.update(role_tag(m));
            hasher.update([0x1f]);
            hasher.update(m.content.as_bytes());
            hasher.update([0x1e]);
        }
        hasher.update(float_repr(params.temperature));
        hasher.update([0x1f]);
        hasher.update(float_repr(params.top_p));
        hasher.update([0x1f]);
        hasher.update(
            params
                .max_tokens
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".into()),
        );
        hex::encode(hasher.finalize())
    }

    /// Look up a fingerprint.  Expired entries are dropped on the spot; a
    /// hit refreshes the entry's recency.
    pub fn get(&self, fingerprint: &str) -> Option<ChatResponse> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.map.peek(fingerprint) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(e) => e.inserted_at.elapsed() > self.ttl,
        };
        if expired {
            inner.map.pop(fingerprint);
            inner.misses += 1;
            return None;
        }
        inner.hits += 1;
        // `get` promotes the entry to most-recently-used.
        inner.map.get(fingerprint).map(|e| e.response.clone())
    }

    /// Insert a response.  At capacity the least-recently-accessed entry is
    /// evicted.  No-op when the cache is disabled.
    pub fn put(&self, fingerprint: String, response: ChatResponse) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.map.push(
            fingerprint,
            Entry {
                response,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove all TTL-expired entries.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len();
        for k in expired {
            inner.map.pop(&k);
        }
        if count > 0 {
            debug!(count, "cache sweep removed expired entries");
        }
    }

    /// Run [`ResponseCache::sweep`] on a fixed period until the handle is
    /// dropped or aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }

    /// `(hits, misses, live entries)` for the status snapshot.
    pub fn stats(&self) -> (u64, u64, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.hits, inner.misses, inner.map.len())
    }
}

fn role_tag(m: &ChatMessage) -> &'static [u8] {
    use chorus_model::Role;
    match m.role {
        Role::System => b"system",
        Role::User => b"user",
        Role::Assistant => b"assistant",
        Role::Tool => b"tool",
    }
}

fn float_repr(v: Option<f32>) -> String {
    v.map(|f| format!("{f:.4}")).unwrap_or_else(|| "-".into())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_model::Usage;

    fn config(enabled: bool, ttl_secs: u64, max_size: usize) -> CacheConfig {
        CacheConfig {
            enabled,
            ttl_secs,
            max_size,
            sweep_interval_secs: 60,
        }
    }

    fn response(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.into(),
            usage: Usage::new(1, 1),
            tool_calls: vec![],
            model: "m".into(),
        }
    }

    fn params(temp: Option<f32>, top_p: Option<f32>, max: Option<u32>) -> SamplingParams {
        SamplingParams {
            temperature: temp,
            top_p,
            max_tokens: max,
            repetition_penalty: None,
        }
    }

    // ── Fingerprint laws ──────────────────────────────────────────────────────

    #[test]
    fn fingerprint_is_deterministic() {
        let msgs = vec![ChatMessage::user("hi"), ChatMessage::assistant("yo")];
        let p = params(Some(0.7), None, Some(100));
        assert_eq!(
            ResponseCache::fingerprint("m", &msgs, &p),
            ResponseCache::fingerprint("m", &msgs, &p),
        );
    }

    #[test]
    fn fingerprint_ignores_agent_tags_and_call_ids() {
        let plain = vec![ChatMessage::assistant("yo")];
        let tagged = vec![ChatMessage::assistant_from("Agent-7", "yo")];
        let p = params(None, None, None);
        assert_eq!(
            ResponseCache::fingerprint("m", &plain, &p),
            ResponseCache::fingerprint("m", &tagged, &p),
        );
    }

    #[test]
    fn fingerprint_changes_with_each_sampling_param() {
        let msgs = vec![ChatMessage::user("hi")];
        let base = ResponseCache::fingerprint("m", &msgs, &params(Some(0.7), Some(0.9), Some(64)));
        let variants = [
            params(Some(0.8), Some(0.9), Some(64)),
            params(Some(0.7), Some(0.8), Some(64)),
            params(Some(0.7), Some(0.9), Some(65)),
            params(None, Some(0.9), Some(64)),
        ];
        for v in variants {
            assert_ne!(base, ResponseCache::fingerprint("m", &msgs, &v), "{v:?}");
        }
    }

    #[test]
    fn fingerprint_changes_with_model_and_content() {
        let msgs = vec![ChatMessage::user("hi")];
        let p = params(None, None, None);
        let base = ResponseCache::fingerprint("m", &msgs, &p);
        assert_ne!(base, ResponseCache::fingerprint("m2", &msgs, &p));
        assert_ne!(
            base,
            ResponseCache::fingerprint("m", &[ChatMessage::user("hi!")], &p)
        );
        // Role matters too.
        assert_ne!(
            base,
            ResponseCache::fingerprint("m", &[ChatMessage::assistant("hi")], &p)
        );
    }

    // ── Cache behavior ────────────────────────────────────────────────────────

    #[test]
    fn get_returns_prior_set_within_ttl() {
        let cache = ResponseCache::new(&config(true, 300, 10));
        cache.put("fp".into(), response("cached"));
        let hit = cache.get("fp").unwrap();
        assert_eq!(hit.content, "cached");
        let (hits, misses, len) = cache.stats();
        assert_eq!((hits, misses, len), (1, 0, 1));
    }

    #[test]
    fn expired_entries_miss_lazily() {
        let cache = ResponseCache::new(&config(true, 0, 10));
        cache.put("fp".into(), response("old"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("fp").is_none());
        let (_, misses, len) = cache.stats();
        assert_eq!(misses, 1);
        assert_eq!(len, 0, "expired entry is dropped on read");
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = ResponseCache::new(&config(true, 300, 2));
        cache.put("a".into(), response("a"));
        cache.put("b".into(), response("b"));
        // Touch "a" so "b" becomes least-recently-used.
        cache.get("a").unwrap();
        cache.put("c".into(), response("c"));
        assert!(cache.get("b").is_none(), "LRU entry evicted");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = ResponseCache::new(&config(true, 0, 10));
        cache.put("x".into(), response("x"));
        cache.put("y".into(), response("y"));
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        let (_, _, len) = cache.stats();
        assert_eq!(len, 0);
    }

    #[test]
    fn disabled_cache_always_misses_and_ignores_writes() {
        let cache = ResponseCache::new(&config(false, 300, 10));
        cache.put("fp".into(), response("never"));
        assert!(cache.get("fp").is_none());
        let (_, _, len) = cache.stats();
        assert_eq!(len, 0);
    }
}

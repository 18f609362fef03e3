// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Credential resolution.
//!
//! The core never stores raw provider keys: agents and config carry opaque
//! references (an env-var name, or nothing), and a [`CredentialProvider`]
//! resolves them at call time.  Backends are pluggable; env-var lookup is
//! the default, a static map serves tests and injected per-agent keys.
//! Resolved keys are never logged.

use std::collections::HashMap;

use crate::registry::get_provider;

/// Resolves a provider id to an API key.
pub trait CredentialProvider: Send + Sync {
    /// Returns the key for `provider`, or `None` when the provider needs no
    /// key or none is configured.
    fn resolve(&self, provider: &str) -> Option<String>;
}

/// Environment-variable backend.
///
/// Per-provider overrides name the variable to read; otherwise the
/// provider's registry default (e.g. `OPENAI_API_KEY`) is used.
#[derive(Default)]
pub struct EnvCredentials {
    /// provider id → env var name
    overrides: HashMap<String, String>,
}

impl EnvCredentials {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }
}

impl CredentialProvider for EnvCredentials {
    fn resolve(&self, provider: &str) -> Option<String> {
        if let Some(var) = self.overrides.get(provider) {
            return std::env::var(var).ok();
        }
        let meta = get_provider(provider)?;
        std::env::var(meta.default_api_key_env?).ok()
    }
}

/// Fixed provider → key map.  Used for per-agent key injection and tests.
#[derive(Default)]
pub struct StaticCredentials {
    keys: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    pub fn insert(&mut self, provider: impl Into<String>, key: impl Into<String>) {
        self.keys.insert(provider.into(), key.into());
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve(&self, provider: &str) -> Option<String> {
        self.keys.get(provider).cloned()
    }
}

/// First backend that yields a key wins.
pub struct LayeredCredentials {
    layers: Vec<Box<dyn CredentialProvider>>,
}

impl LayeredCredentials {
    pub fn new(layers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { layers }
    }
}

impl CredentialProvider for LayeredCredentials {
    fn resolve(&self, provider: &str) -> Option<String> {
        self.layers.iter().find_map(|l| l.resolve(provider))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_backend_returns_inserted_key() {
        let mut c = StaticCredentials::default();
        c.insert("openai", "sk-test");
        assert_eq!(c.resolve("openai").as_deref(), Some("sk-test"));
        assert!(c.resolve("anthropic").is_none());
    }

    #[test]
    fn layered_first_hit_wins() {
        let mut a = StaticCredentials::default();
        a.insert("openai", "from-a");
        let mut b = StaticCredentials::default();
        b.insert("openai", "from-b");
        b.insert("groq", "groq-key");
        let layered = LayeredCredentials::new(vec![Box::new(a), Box::new(b)]);
        assert_eq!(layered.resolve("openai").as_deref(), Some("from-a"));
        assert_eq!(layered.resolve("groq").as_deref(), Some("groq-key"));
        assert!(layered.resolve("mistral").is_none());
    }

    #[test]
    fn env_backend_reads_override_variable() {
        let var = "CHORUS_TEST_CRED_OVERRIDE";
        std::env::set_var(var, "override-key");
        let mut overrides = HashMap::new();
        overrides.insert("openai".to_string(), var.to_string());
        let c = EnvCredentials::new(overrides);
        assert_eq!(c.resolve("openai").as_deref(), Some("override-key"));
        std::env::remove_var(var);
    }

    #[test]
    fn env_backend_keyless_provider_resolves_none() {
        let c = EnvCredentials::default();
        // ollama has no default key env; mock has none either.
        assert!(c.resolve("ollama").is_none());
        assert!(c.resolve("mock").is_none());
    }
}

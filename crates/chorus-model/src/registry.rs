// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider and model registries.
//!
//! [`PROVIDERS`] is the single source of truth for which provider ids exist,
//! their wire dialect and credential defaults.  [`ModelRegistry`] maps
//! logical model names to a provider binding and context window, plus the
//! ordered fallback chain consulted when a model is unavailable.  Both are
//! read-only after initialization.

use std::collections::HashMap;

use chorus_config::ModelEntryConfig;

/// Wire dialect spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `/chat/completions` + SSE — OpenAI and the many compatible APIs.
    OpenAiCompat,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Generative Language API.
    Google,
    /// In-process test double, no network.
    Mock,
}

/// Metadata describing a registered provider.
#[derive(Debug, Clone)]
pub struct ProviderMeta {
    /// Unique provider id used in agent bindings (e.g. `"openai"`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// Default environment variable that holds the API key.
    /// `None` for providers that require no key (local servers, mock).
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when config does not override it.
    pub default_base_url: Option<&'static str>,
    pub wire: WireFormat,
}

/// Complete registry of supported providers.
pub static PROVIDERS: &[ProviderMeta] = &[
    ProviderMeta {
        id: "openai",
        name: "OpenAI",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        wire: WireFormat::OpenAiCompat,
    },
    ProviderMeta {
        id: "anthropic",
        name: "Anthropic",
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
        wire: WireFormat::Anthropic,
    },
    ProviderMeta {
        id: "google",
        name: "Google Gemini",
        default_api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
        wire: WireFormat::Google,
    },
    ProviderMeta {
        id: "groq",
        name: "Groq",
        default_api_key_env: Some("GROQ_API_KEY"),
        default_base_url: Some("https://api.groq.com/openai/v1"),
        wire: WireFormat::OpenAiCompat,
    },
    ProviderMeta {
        id: "openrouter",
        name: "OpenRouter",
        default_api_key_env: Some("OPENROUTER_API_KEY"),
        default_base_url: Some("https://openrouter.ai/api/v1"),
        wire: WireFormat::OpenAiCompat,
    },
    ProviderMeta {
        id: "mistral",
        name: "Mistral AI",
        default_api_key_env: Some("MISTRAL_API_KEY"),
        default_base_url: Some("https://api.mistral.ai/v1"),
        wire: WireFormat::OpenAiCompat,
    },
    ProviderMeta {
        id: "deepseek",
        name: "DeepSeek",
        default_api_key_env: Some("DEEPSEEK_API_KEY"),
        default_base_url: Some("https://api.deepseek.com/v1"),
        wire: WireFormat::OpenAiCompat,
    },
    ProviderMeta {
        id: "ollama",
        name: "Ollama",
        default_api_key_env: None,
        default_base_url: Some("http://localhost:11434/v1"),
        wire: WireFormat::OpenAiCompat,
    },
    ProviderMeta {
        id: "mock",
        name: "Mock",
        default_api_key_env: None,
        default_base_url: None,
        wire: WireFormat::Mock,
    },
];

/// Look up a provider by its id.  Returns `None` for unknown ids.
pub fn get_provider(id: &str) -> Option<&'static ProviderMeta> {
    PROVIDERS.iter().find(|p| p.id == id)
}

/// Returns an iterator over all known provider ids.
pub fn known_provider_ids() -> impl Iterator<Item = &'static str> {
    PROVIDERS.iter().map(|p| p.id)
}

// ─── Model registry ───────────────────────────────────────────────────────────

/// One registered model: logical name → provider binding.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub model: String,
    pub provider: String,
    /// Identifier forwarded on the provider's wire.
    pub api_name: String,
    pub context_window_tokens: u32,
}

/// Compiled-in registrations; config entries are merged over these.
fn builtin_models() -> Vec<ModelEntry> {
    fn entry(model: &str, provider: &str, window: u32) -> ModelEntry {
        ModelEntry {
            model: model.into(),
            provider: provider.into(),
            api_name: model.into(),
            context_window_tokens: window,
        }
    }
    vec![
        entry("gpt-4o", "openai", 128_000),
        entry("gpt-4o-mini", "openai", 128_000),
        entry("claude-3-5-sonnet", "anthropic", 200_000),
        entry("claude-3-5-haiku", "anthropic", 200_000),
        entry("gemini-2.0-flash", "google", 1_048_576),
        entry("gemini-1.5-pro", "google", 2_097_152),
        entry("llama-3.3-70b-versatile", "groq", 128_000),
        entry("mistral-large-latest", "mistral", 128_000),
        entry("deepseek-chat", "deepseek", 64_000),
    ]
}

/// Process-wide, read-only model table plus fallback chains.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: HashMap<String, ModelEntry>,
    fallbacks: HashMap<String, Vec<String>>,
}

impl ModelRegistry {
    /// Only the compiled-in registrations, no fallback chains.
    pub fn builtin() -> Self {
        Self {
            entries: builtin_models()
                .into_iter()
                .map(|e| (e.model.clone(), e))
                .collect(),
            fallbacks: HashMap::new(),
        }
    }

    /// Builtin registrations merged with config, then fallback chains
    /// validated: a chain may only reference registered models and never
    /// its own head.
    pub fn from_config(
        models: &[ModelEntryConfig],
        fallbacks: &HashMap<String, Vec<String>>,
    ) -> Result<Self, String> {
        let mut reg = Self::builtin();
        for m in models {
            if get_provider(&m.provider).is_none() {
                return Err(format!(
                    "model {:?} references unknown provider {:?} (known: {})",
                    m.model,
                    m.provider,
                    known_provider_ids().collect::<Vec<_>>().join(", ")
                ));
            }
            reg.entries.insert(
                m.model.clone(),
                ModelEntry {
                    model: m.model.clone(),
                    provider: m.provider.clone(),
                    api_name: m.api_name.clone().unwrap_or_else(|| m.model.clone()),
                    context_window_tokens: m.context_window,
                },
            );
        }
        for (model, chain) in fallbacks {
            if !reg.entries.contains_key(model) {
                return Err(format!("fallback chain head {model:?} is not a registered model"));
            }
            for fb in chain {
                if !reg.entries.contains_key(fb) {
                    return Err(format!(
                        "fallback {fb:?} for model {model:?} is not a registered model"
                    ));
                }
                if fb == model {
                    return Err(format!("model {model:?} lists itself as a fallback"));
                }
            }
            reg.fallbacks.insert(model.clone(), chain.clone());
        }
        Ok(reg)
    }

    pub fn get(&self, model: &str) -> Option<&ModelEntry> {
        self.entries.get(model)
    }

    /// All registered logical model names, sorted.
    pub fn known_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ordered fallback chain for `model` (empty when none is configured).
    pub fn fallback_chain(&self, model: &str) -> &[String] {
        self.fallbacks.get(model).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_registry_is_non_empty_with_unique_ids() {
        let mut seen = std::collections::HashSet::new();
        for p in PROVIDERS {
            assert!(seen.insert(p.id), "duplicate provider id: {}", p.id);
        }
        assert!(get_provider("openai").is_some());
        assert!(get_provider("nope-xyz").is_none());
    }

    #[test]
    fn builtin_models_resolve_known_providers() {
        let reg = ModelRegistry::builtin();
        for name in reg.known_models() {
            let entry = reg.get(&name).unwrap();
            assert!(
                get_provider(&entry.provider).is_some(),
                "model {name} references unregistered provider {}",
                entry.provider
            );
        }
    }

    #[test]
    fn config_models_are_merged_over_builtins() {
        let models = vec![ModelEntryConfig {
            model: "tiny".into(),
            provider: "ollama".into(),
            api_name: Some("tinyllama:latest".into()),
            context_window: 4096,
        }];
        let reg = ModelRegistry::from_config(&models, &HashMap::new()).unwrap();
        let e = reg.get("tiny").unwrap();
        assert_eq!(e.api_name, "tinyllama:latest");
        assert_eq!(e.context_window_tokens, 4096);
        // Builtins survive the merge.
        assert!(reg.get("gpt-4o").is_some());
    }

    #[test]
    fn fallback_chain_must_reference_registered_models() {
        let mut fallbacks = HashMap::new();
        fallbacks.insert("gpt-4o".to_string(), vec!["no-such-model".to_string()]);
        let err = ModelRegistry::from_config(&[], &fallbacks).unwrap_err();
        assert!(err.contains("no-such-model"), "unexpected error: {err}");
    }

    #[test]
    fn fallback_chain_rejects_self_reference() {
        let mut fallbacks = HashMap::new();
        fallbacks.insert("gpt-4o".to_string(), vec!["gpt-4o".to_string()]);
        assert!(ModelRegistry::from_config(&[], &fallbacks).is_err());
    }

    #[test]
    fn fallback_chain_preserves_order() {
        let mut fallbacks = HashMap::new();
        fallbacks.insert(
            "gpt-4o".to_string(),
            vec!["claude-3-5-sonnet".to_string(), "gemini-2.0-flash".to_string()],
        );
        let reg = ModelRegistry::from_config(&[], &fallbacks).unwrap();
        assert_eq!(
            reg.fallback_chain("gpt-4o"),
            ["claude-3-5-sonnet".to_string(), "gemini-2.0-flash".to_string()]
        );
        assert!(reg.fallback_chain("gpt-4o-mini").is_empty());
    }
}

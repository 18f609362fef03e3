// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Per-provider credential references and endpoint overrides, keyed by
    /// provider id (`"openai"`, `"anthropic"`, `"google"`, ...).
    ///
    /// ```yaml
    /// providers:
    ///   anthropic:
    ///     api_key_env: ANTHROPIC_API_KEY
    ///   local_llama:
    ///     base_url: http://localhost:11434/v1
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Extra model registrations merged over the compiled-in registry.
    #[serde(default)]
    pub models: Vec<ModelEntryConfig>,
    /// Ordered fallback chain per logical model name.
    #[serde(default)]
    pub fallbacks: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address the WebSocket gateway binds to.
    pub bind: String,
    /// Outbound event queue capacity per client connection.  When the queue
    /// is full, non-essential events are dropped first; a critical event
    /// that cannot be queued closes the connection.
    pub queue_capacity: usize,
    /// Idle session expiry.  Sessions with no traffic for this long are
    /// destroyed together with their conversation memory.
    pub session_idle_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7070".into(),
            queue_capacity: 64,
            session_idle_secs: 3600,
        }
    }
}

/// Credential reference and endpoint overrides for one provider.
///
/// Raw keys never live in this struct; `api_key_env` names the environment
/// variable resolved at call time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Environment variable holding the API key.  When unset, the registry
    /// default for the provider (e.g. `OPENAI_API_KEY`) is used.
    pub api_key_env: Option<String>,
    /// Base URL override.  Useful for proxies and local servers.
    pub base_url: Option<String>,
}

/// One model registration: logical name → provider binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntryConfig {
    pub model: String,
    pub provider: String,
    /// Model identifier on the provider's wire.  Defaults to `model`.
    pub api_name: Option<String>,
    pub context_window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub default: QuotaConfig,
    /// Per-provider quota overrides.
    #[serde(default)]
    pub per_provider: HashMap<String, QuotaConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: QuotaConfig::default(),
            per_provider: HashMap::new(),
        }
    }
}

/// Token-bucket shape for one provider: `burst` is the bucket capacity,
/// `per_second` the steady-state refill rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub burst: u32,
    pub per_second: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            per_second: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a CLOSED breaker.
    pub failure_threshold: u32,
    /// Seconds an OPEN breaker rejects before admitting a half-open probe.
    pub reset_timeout_secs: u64,
    /// Rolling window used for the success-rate metric.
    pub monitoring_period_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30,
            monitoring_period_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_size: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_size: 1024,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fraction of agents that must respond successfully before consensus
    /// analysis begins.
    pub consensus_threshold: f64,
    pub max_consensus_iterations: u32,
    pub competitive_timeout_ms: u64,
    /// Overall orchestration deadline; all child calls are cancelled on expiry.
    pub deadline_secs: u64,
    /// Maximum model-fallback hops per agent call.
    pub max_fallback_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.7,
            max_consensus_iterations: 5,
            competitive_timeout_ms: 30_000,
            deadline_secs: 120,
            max_fallback_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding the persisted memory documents.  `None` disables
    /// persistence (memory is process-lifetime only).
    pub dir: Option<String>,
    pub autosave_interval_secs: u64,
    /// Conversation memories retained on disk (most recent sessions).
    pub keep_sessions: usize,
    /// Reward/punishment log entries retained per agent on save.
    pub keep_log_entries: usize,
    /// Structured memory entries retained per agent on save.
    pub keep_structured_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            autosave_interval_secs: 60,
            keep_sessions: 50,
            keep_log_entries: 100,
            keep_structured_entries: 500,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.breaker.failure_threshold, cfg.breaker.failure_threshold);
        assert_eq!(back.cache.max_size, cfg.cache.max_size);
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.rate_limit.default.burst, 10);
        assert_eq!(cfg.orchestrator.consensus_threshold, 0.7);
    }

    #[test]
    fn cache_enabled_can_be_turned_off() {
        let cfg: Config = serde_yaml::from_str("cache:\n  enabled: false\n").unwrap();
        assert!(!cfg.cache.enabled);
        // Unspecified siblings keep their defaults.
        assert_eq!(cfg.cache.ttl_secs, 300);
    }

    #[test]
    fn provider_and_fallback_sections_parse() {
        let text = r#"
providers:
  openai:
    api_key_env: MY_OPENAI_KEY
models:
  - { model: tiny, provider: openai, context_window: 8192 }
fallbacks:
  tiny: [gpt-4o-mini]
"#;
        let cfg: Config = serde_yaml::from_str(text).unwrap();
        assert_eq!(
            cfg.providers["openai"].api_key_env.as_deref(),
            Some("MY_OPENAI_KEY")
        );
        assert_eq!(cfg.models[0].model, "tiny");
        assert_eq!(cfg.fallbacks["tiny"], vec!["gpt-4o-mini".to_string()]);
    }
}

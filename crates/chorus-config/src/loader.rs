// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration loading.
//!
//! A chorus deployment typically splits its configuration by ownership:
//! the fleet operator ships the shared model registry, provider endpoints
//! and rate quotas in `/etc/chorus/`, each user keeps credential wiring in
//! their config directory, and a deployment checkout may pin overrides in
//! a `chorus.yaml` next to the binary.  Files are typed as [`ConfigLayer`]s
//! and folded in that order, with an explicit `--config` path folded last.
//!
//! Folding is not a generic tree merge — each section combines the way its
//! contents demand:
//!
//! - **Registries accumulate.**  `providers` and `models` union across
//!   layers (a user file adds a provider without erasing the fleet's
//!   registry); re-declaring a provider id or model name rebinds it.
//! - **Fallback chains replace wholesale.**  Chain order encodes failover
//!   priority, so splicing two partial chains together would scramble it;
//!   the last layer to mention a model owns that model's entire chain.
//!   `per_provider` rate quotas likewise replace per provider id.
//! - **Tuning sections replace as a unit.**  `gateway`, `breaker`, `cache`,
//!   `orchestrator` and `memory` are small coherent knob sets; a layer that
//!   declares one owns it, with unset fields falling back to the compiled
//!   defaults rather than inheriting a lower layer's half-tuned values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

use crate::{
    BreakerConfig, CacheConfig, Config, GatewayConfig, MemoryConfig, ModelEntryConfig,
    OrchestratorConfig, ProviderConfig, QuotaConfig,
};

/// One configuration file before folding: every section optional, registry
/// sections empty rather than absent so they can union cleanly.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    gateway: Option<GatewayConfig>,
    #[serde(default)]
    providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    models: Vec<ModelEntryConfig>,
    #[serde(default)]
    fallbacks: HashMap<String, Vec<String>>,
    rate_limit: Option<RateLimitLayer>,
    breaker: Option<BreakerConfig>,
    cache: Option<CacheConfig>,
    orchestrator: Option<OrchestratorConfig>,
    memory: Option<MemoryConfig>,
}

/// Rate limiting splits along the same line as the rest of the config: the
/// default quota is a tuning knob (replace), the per-provider table is a
/// registry (union).
#[derive(Debug, Default, Deserialize)]
struct RateLimitLayer {
    default: Option<QuotaConfig>,
    #[serde(default)]
    per_provider: HashMap<String, QuotaConfig>,
}

/// Where configuration may live, in folding order: fleet-wide, per-user,
/// then the deployment checkout.
fn layer_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/chorus/config.yaml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/chorus/config.yaml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("chorus/config.yaml"));
    }
    paths.push(PathBuf::from(".chorus.yaml"));
    paths.push(PathBuf::from("chorus.yaml"));
    paths
}

/// Build the effective [`Config`]: start from compiled defaults, fold every
/// discovered layer, then the explicit `extra` path (a `--config` flag)
/// with the final say.  Missing files are skipped; unparseable ones are
/// errors, never silently ignored.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = Config::default();

    for path in layer_paths() {
        if !path.is_file() {
            continue;
        }
        debug!(path = %path.display(), "folding config layer");
        fold_layer(&mut config, read_layer(&path)?);
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "folding explicit config");
        fold_layer(&mut config, read_layer(p)?);
    }

    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<ConfigLayer> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Apply one layer on top of the accumulated config, per the section rules
/// in the module docs.
fn fold_layer(config: &mut Config, layer: ConfigLayer) {
    config.providers.extend(layer.providers);

    // Model registrations are keyed by logical name; re-registering a name
    // rebinds it in place, new names append in declaration order.
    for entry in layer.models {
        match config.models.iter_mut().find(|m| m.model == entry.model) {
            Some(slot) => *slot = entry,
            None => config.models.push(entry),
        }
    }

    config.fallbacks.extend(layer.fallbacks);

    if let Some(rate_limit) = layer.rate_limit {
        if let Some(default) = rate_limit.default {
            config.rate_limit.default = default;
        }
        config.rate_limit.per_provider.extend(rate_limit.per_provider);
    }

    if let Some(gateway) = layer.gateway {
        config.gateway = gateway;
    }
    if let Some(breaker) = layer.breaker {
        config.breaker = breaker;
    }
    if let Some(cache) = layer.cache {
        config.cache = cache;
    }
    if let Some(orchestrator) = layer.orchestrator {
        config.orchestrator = orchestrator;
    }
    if let Some(memory) = layer.memory {
        config.memory = memory;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

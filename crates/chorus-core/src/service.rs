// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The single call path for chat generation.
//!
//! Every agent call flows through the same pipeline:
//! registry → token estimate → rate-limit admission → cache → circuit
//! breaker → adapter (bounded retry) → tool round-trip → cache store,
//! with the model-fallback chain wrapped around the whole thing.  Fallback
//! re-entries run the full pipeline again, including rate-limit admission.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chorus_config::Config;
use chorus_model::{
    ChatAdapter, ChatMessage, ChatRequest, ChatResponse, CredentialProvider, ModelEntry,
    ModelRegistry, ProviderError, SamplingParams, ToolCall, Usage,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    breaker::{BreakerRegistry, BreakerScope, BreakerState},
    cache::ResponseCache,
    limiter::ProviderLimiter,
    tools::ToolNegotiator,
    CoreError,
};

/// Bounded-retry shape for retryable provider failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// One chat-generation request as the orchestrator sees it.
#[derive(Debug, Clone, Default)]
pub struct ChatCall {
    /// Logical model name (registry key).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: String,
    pub params: SamplingParams,
    pub enable_tools: bool,
    /// Tool allow-list archetype for this agent.
    pub archetype: Option<String>,
    /// Name for the agent-scope breaker; `None` gates on the model breaker
    /// only.
    pub agent_breaker: Option<String>,
    /// Per-call credential override (e.g. an agent-supplied key).
    pub api_key: Option<String>,
}

/// One model-fallback hop taken while serving a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackHop {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub usage: Usage,
    /// Tool calls the model requested (already executed and folded into
    /// `content` via the follow-up call).
    pub tool_calls: Vec<ToolCall>,
    /// Logical model that actually produced the response.
    pub model_used: String,
    pub cached: bool,
    pub fallbacks: Vec<FallbackHop>,
}

pub struct LlmService {
    registry: ModelRegistry,
    limiter: ProviderLimiter,
    breakers: BreakerRegistry,
    cache: Arc<ResponseCache>,
    negotiator: Arc<ToolNegotiator>,
    credentials: Arc<dyn CredentialProvider>,
    provider_base_urls: HashMap<String, String>,
    /// Adapter instances keyed by `provider:credential-digest`, so a bad
    /// key only recycles its own client.
    adapters: Mutex<HashMap<String, Arc<dyn ChatAdapter>>>,
    /// Test/deployment overrides, consulted before adapter construction.
    model_adapters: Mutex<HashMap<String, Arc<dyn ChatAdapter>>>,
    provider_adapters: Mutex<HashMap<String, Arc<dyn ChatAdapter>>>,
    retry: RetryPolicy,
    max_fallback_depth: usize,
}

impl LlmService {
    pub fn new(
        registry: ModelRegistry,
        config: &Config,
        credentials: Arc<dyn CredentialProvider>,
        negotiator: Arc<ToolNegotiator>,
    ) -> Self {
        let provider_base_urls = config
            .providers
            .iter()
            .filter_map(|(id, p)| p.base_url.clone().map(|u| (id.clone(), u)))
            .collect();
        Self {
            registry,
            limiter: ProviderLimiter::new(config.rate_limit.clone()),
            breakers: BreakerRegistry::new(&config.breaker),
            cache: Arc::new(ResponseCache::new(&config.cache)),
            negotiator,
            credentials,
            provider_base_urls,
            adapters: Mutex::new(HashMap::new()),
            model_adapters: Mutex::new(HashMap::new()),
            provider_adapters: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
            max_fallback_depth: config.orchestrator.max_fallback_depth,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route every call for `model` to this adapter (mocks, local stands-in).
    pub fn register_model_adapter(&self, model: &str, adapter: Arc<dyn ChatAdapter>) {
        self.model_adapters
            .lock()
            .unwrap()
            .insert(model.to_string(), adapter);
    }

    /// Route every call for `provider` to this adapter.
    pub fn register_provider_adapter(&self, provider: &str, adapter: Arc<dyn ChatAdapter>) {
        self.provider_adapters
            .lock()
            .unwrap()
            .insert(provider.to_string(), adapter);
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn negotiator(&self) -> &Arc<ToolNegotiator> {
        &self.negotiator
    }

    /// Serve one chat call, walking the model-fallback chain when the
    /// primary is unavailable.
    pub async fn chat(&self, call: &ChatCall) -> Result<ChatOutcome, CoreError> {
        let mut model = call.model.clone();
        let mut hops: Vec<FallbackHop> = Vec::new();
        let mut tried: HashSet<String> = HashSet::from([model.clone()]);

        loop {
            match self.chat_once(&model, call).await {
                Ok(mut outcome) => {
                    outcome.fallbacks = hops;
                    return Ok(outcome);
                }
                Err(e) => {
                    if !fallback_eligible(&e) || hops.len() >= self.max_fallback_depth {
                        return Err(e);
                    }
                    // First still-viable entry: registered, not yet tried,
                    // and its breaker is not open.
                    let next = self
                        .registry
                        .fallback_chain(&model)
                        .iter()
                        .find(|m| {
                            !tried.contains(*m)
                                && self.breakers.get(BreakerScope::Model, m).state()
                                    != BreakerState::Open
                        })
                        .cloned();
                    let Some(next) = next else {
                        return Err(e);
                    };
                    warn!(from = %model, to = %next, error = %e, "model fallback");
                    hops.push(FallbackHop {
                        from: model.clone(),
                        to: next.clone(),
                    });
                    tried.insert(next.clone());
                    model = next;
                }
            }
        }
    }

    /// One pass of the pipeline for a specific model, no fallback.
    async fn chat_once(&self, model: &str, call: &ChatCall) -> Result<ChatOutcome, CoreError> {
        // 1. Resolve the model.
        let entry = self
            .registry
            .get(model)
            .ok_or_else(|| CoreError::ModelNotSupported {
                model: model.to_string(),
                known: self.registry.known_models(),
            })?
            .clone();

        // 2. Cheap token estimate against the context window.
        let estimated = estimate_tokens(&call.messages, &call.system);
        let limit = entry.context_window_tokens as usize;
        if estimated > limit {
            return Err(CoreError::ContextWindowExceeded { estimated, limit });
        }

        // 3. Rate-limit admission, one token per outgoing call.
        self.limiter.check(&entry.provider)?;

        // 4. Cache lookup.
        let fingerprint = ResponseCache::fingerprint(model, &call.messages, &call.params);
        if let Some(hit) = self.cache.get(&fingerprint) {
            debug!(model, "cache hit");
            return Ok(ChatOutcome {
                content: hit.content,
                usage: hit.usage,
                tool_calls: hit.tool_calls,
                model_used: model.to_string(),
                cached: true,
                fallbacks: Vec::new(),
            });
        }

        // 5. Circuit breakers: model scope always, agent scope when named.
        let model_breaker = self.breakers.get(BreakerScope::Model, model);
        model_breaker.admit()?;
        let agent_breaker = match &call.agent_breaker {
            Some(name) => {
                let b = self.breakers.get(BreakerScope::Agent, name);
                if let Err(e) = b.admit() {
                    model_breaker.cancel_admission();
                    return Err(e);
                }
                Some(b)
            }
            None => None,
        };
        let record = |success: bool| {
            model_breaker.record(success);
            if let Some(b) = &agent_breaker {
                b.record(success);
            }
        };

        let tools = if call.enable_tools {
            self.negotiator.advertise(call.archetype.as_deref())
        } else {
            Vec::new()
        };
        let req = ChatRequest {
            api_name: entry.api_name.clone(),
            messages: call.messages.clone(),
            system: call.system.clone(),
            params: call.params.clone(),
            tools,
        };

        let adapter = match self.adapter_for(model, &entry, call.api_key.clone()) {
            Ok(a) => a,
            Err(e) => {
                model_breaker.cancel_admission();
                if let Some(b) = &agent_breaker {
                    b.cancel_admission();
                }
                return Err(e);
            }
        };

        match self.call_with_retry(adapter.as_ref(), &req).await {
            Ok(first) => {
                let outcome = if first.wants_tools() && call.enable_tools {
                    match self.tool_round_trip(adapter.as_ref(), &req, first).await {
                        Ok(o) => o,
                        Err(e) => {
                            record(false);
                            return Err(self.map_provider_error(e, estimated, limit));
                        }
                    }
                } else {
                    first
                };
                record(true);

                let result = ChatOutcome {
                    content: outcome.content.clone(),
                    usage: outcome.usage,
                    tool_calls: outcome.tool_calls.clone(),
                    model_used: model.to_string(),
                    cached: false,
                    fallbacks: Vec::new(),
                };
                self.cache.put(fingerprint, outcome);
                Ok(result)
            }
            Err(e) => {
                record(false);
                Err(self.map_provider_error(e, estimated, limit))
            }
        }
    }

    /// Execute requested tools and re-invoke the adapter exactly once for
    /// the final assistant message.  Usage accumulates across both calls.
    async fn tool_round_trip(
        &self,
        adapter: &dyn ChatAdapter,
        req: &ChatRequest,
        first: ChatResponse,
    ) -> Result<ChatResponse, ProviderError> {
        let mut messages = req.messages.clone();
        messages.push(ChatMessage::assistant_tool_calls(first.tool_calls.clone()));
        for tc in &first.tool_calls {
            let result = match self.negotiator.invoke(&tc.name, &tc.arguments).await {
                Ok(v) => v,
                // Unknown tool: surface what happened to the model rather
                // than failing the whole call.
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            messages.push(ToolNegotiator::result_message(tc, &result));
        }

        let follow_up = ChatRequest {
            api_name: req.api_name.clone(),
            messages,
            system: req.system.clone(),
            params: req.params.clone(),
            tools: req.tools.clone(),
        };
        let mut second = adapter.complete(&follow_up).await?;
        let mut usage = first.usage;
        usage.add(second.usage);
        second.usage = usage;
        second.tool_calls = first.tool_calls;
        Ok(second)
    }

    /// Adapter call under bounded retry.  Only retryable failures (429,
    /// 5xx, transport) are retried; backoff doubles per attempt and the
    /// sleeps are plain `tokio::time::sleep`, so cancellation propagates.
    async fn call_with_retry(
        &self,
        adapter: &dyn ChatAdapter,
        req: &ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match adapter.complete(req).await {
                Ok(r) => return Ok(r),
                Err(e) if e.retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.base_backoff * 2u32.pow(attempt);
                    warn!(
                        provider = adapter.provider(),
                        attempt,
                        ?backoff,
                        error = %e,
                        "retryable provider failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn adapter_for(
        &self,
        model: &str,
        entry: &ModelEntry,
        api_key: Option<String>,
    ) -> Result<Arc<dyn ChatAdapter>, CoreError> {
        if let Some(a) = self.model_adapters.lock().unwrap().get(model) {
            return Ok(a.clone());
        }
        if let Some(a) = self.provider_adapters.lock().unwrap().get(&entry.provider) {
            return Ok(a.clone());
        }

        let key = api_key.or_else(|| self.credentials.resolve(&entry.provider));
        let cache_key = format!("{}:{}", entry.provider, credential_digest(key.as_deref()));
        let mut adapters = self.adapters.lock().unwrap();
        if let Some(a) = adapters.get(&cache_key) {
            return Ok(a.clone());
        }
        let base_url = self.provider_base_urls.get(&entry.provider).cloned();
        let adapter: Arc<dyn ChatAdapter> =
            chorus_model::build_adapter(&entry.provider, key, base_url)
                .map_err(|e| CoreError::Validation(e.to_string()))?
                .into();
        adapters.insert(cache_key, adapter.clone());
        Ok(adapter)
    }

    fn map_provider_error(
        &self,
        e: ProviderError,
        estimated: usize,
        limit: usize,
    ) -> CoreError {
        match e {
            ProviderError::Authentication { provider, .. } => {
                CoreError::Authentication { provider }
            }
            ProviderError::ContextWindow { .. } => {
                CoreError::ContextWindowExceeded { estimated, limit }
            }
            ProviderError::Validation { message, .. } => CoreError::Validation(message),
            ProviderError::RateLimit { provider, .. } => CoreError::Provider {
                provider,
                status: Some(429),
                message: "rate limited upstream after retries".into(),
            },
            ProviderError::Server {
                provider,
                status,
                message,
            } => CoreError::Provider {
                provider,
                status: Some(status),
                message,
            },
            ProviderError::Transport { provider, message }
            | ProviderError::Unexpected { provider, message } => CoreError::Provider {
                provider,
                status: None,
                message,
            },
        }
    }
}

/// `⌈total_chars / 4⌉` over all message content plus the system prompt.
fn estimate_tokens(messages: &[ChatMessage], system: &str) -> usize {
    let chars: usize =
        messages.iter().map(|m| m.content.len()).sum::<usize>() + system.len();
    chars.div_ceil(4)
}

/// A failure worth walking the fallback chain for: the breaker is open, the
/// provider is down, or the credential is bad.  Validation and local
/// rate-limit failures stay with the primary model.
fn fallback_eligible(e: &CoreError) -> bool {
    matches!(
        e,
        CoreError::CircuitOpen { .. }
            | CoreError::Provider { .. }
            | CoreError::Authentication { .. }
    )
}

fn credential_digest(key: Option<&str>) -> String {
    match key {
        None => "anon".into(),
        Some(k) => {
            let mut hasher = Sha256::new();
            hasher.update(k.as_bytes());
            hex::encode(&hasher.finalize()[..6])
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

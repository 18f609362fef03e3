// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-provider admission control.
//!
//! One token bucket per provider: `burst` is the bucket capacity,
//! `per_second` the steady-state refill rate.  Admission never blocks —
//! an empty bucket fails fast with the wait until one token regenerates,
//! and the caller decides whether to surface or reschedule.  Every outgoing
//! provider call passes admission, including fallback-chain re-entries.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use chorus_config::{QuotaConfig, RateLimitConfig};
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tracing::debug;

use crate::CoreError;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Admission gate over all providers.  Buckets are created lazily on first
/// use so providers that never serve traffic cost nothing; quotas differ
/// per provider, so each gets its own bucket rather than one keyed store.
pub struct ProviderLimiter {
    default_quota: QuotaConfig,
    per_provider: HashMap<String, QuotaConfig>,
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
    clock: DefaultClock,
}

impl ProviderLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            default_quota: config.default,
            per_provider: config.per_provider,
            buckets: Mutex::new(HashMap::new()),
            clock: DefaultClock::default(),
        }
    }

    /// Try to take one token from `provider`'s bucket.
    ///
    /// Atomic across concurrent callers (the bucket state is a single CAS
    /// cell).  On an empty bucket returns [`CoreError::RateLimited`] carrying
    /// the computed wait until one token regenerates.
    pub fn check(&self, provider: &str) -> Result<(), CoreError> {
        let bucket = self.bucket_for(provider);
        bucket.check().map_err(|not_until| {
            let retry_after = not_until.wait_time_from(self.clock.now());
            debug!(provider, ?retry_after, "rate limit admission refused");
            CoreError::RateLimited { retry_after }
        })
    }

    fn bucket_for(&self, provider: &str) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(b) = buckets.get(provider) {
            return b.clone();
        }
        let quota_cfg = self
            .per_provider
            .get(provider)
            .unwrap_or(&self.default_quota);
        let bucket = Arc::new(RateLimiter::direct(build_quota(quota_cfg)));
        buckets.insert(provider.to_string(), bucket.clone());
        bucket
    }
}

/// Governor rejects zero quotas, so both knobs are clamped to at least 1.
fn build_quota(cfg: &QuotaConfig) -> Quota {
    let per_second = NonZeroU32::new(cfg.per_second.max(1)).expect("clamped above");
    let burst = NonZeroU32::new(cfg.burst.max(1)).expect("clamped above");
    Quota::per_second(per_second).allow_burst(burst)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(burst: u32, per_second: u32) -> ProviderLimiter {
        ProviderLimiter::new(RateLimitConfig {
            default: QuotaConfig { burst, per_second },
            per_provider: HashMap::new(),
        })
    }

    #[test]
    fn admits_up_to_burst_then_rejects() {
        let l = limiter(3, 1);
        assert!(l.check("openai").is_ok());
        assert!(l.check("openai").is_ok());
        assert!(l.check("openai").is_ok());
        let err = l.check("openai").unwrap_err();
        match err {
            CoreError::RateLimited { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn providers_have_independent_buckets() {
        let l = limiter(1, 1);
        assert!(l.check("openai").is_ok());
        assert!(l.check("openai").is_err());
        // A different provider still has its full burst.
        assert!(l.check("anthropic").is_ok());
    }

    #[test]
    fn per_provider_override_applies() {
        let mut per_provider = HashMap::new();
        per_provider.insert("groq".to_string(), QuotaConfig { burst: 1, per_second: 1 });
        let l = ProviderLimiter::new(RateLimitConfig {
            default: QuotaConfig { burst: 100, per_second: 100 },
            per_provider,
        });
        assert!(l.check("groq").is_ok());
        assert!(l.check("groq").is_err(), "override burst of 1 must apply");
        // Default-quota provider is far from exhausted.
        for _ in 0..50 {
            assert!(l.check("openai").is_ok());
        }
    }

    #[test]
    fn zero_config_values_are_clamped() {
        let l = limiter(0, 0);
        // Clamped to burst 1 / 1 per second rather than panicking.
        assert!(l.check("openai").is_ok());
        assert!(l.check("openai").is_err());
    }

    #[test]
    fn bucket_refills_over_time() {
        let l = limiter(1, 50);
        assert!(l.check("openai").is_ok());
        assert!(l.check("openai").is_err());
        std::thread::sleep(Duration::from_millis(40));
        assert!(l.check("openai").is_ok(), "bucket should refill at 50/s");
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Circuit breakers, one per `(scope, name)`.
//!
//! State machine:
//! - **Closed** — calls flow; `failure_threshold` consecutive failures trip
//!   the breaker to Open and arm the half-open timer.  Any success zeroes
//!   the failure count.
//! - **Open** — admission is refused immediately until `reset_timeout` has
//!   elapsed, then the next admission attempt transitions to HalfOpen.
//! - **HalfOpen** — exactly one probe is admitted.  Probe success returns to
//!   Closed with counters cleared; probe failure re-opens and re-arms.
//!
//! The rolling window records per-request outcomes for the success-rate
//! metric only; state transitions are driven solely by the consecutive
//! failure counter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chorus_config::BreakerConfig;
use serde::Serialize;
use tracing::{info, warn};

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerScope {
    Model,
    Agent,
}

impl std::fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub monitoring_period: Duration,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(cfg.reset_timeout_secs),
            monitoring_period: Duration::from_secs(cfg.monitoring_period_secs),
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    next_half_open_at: Option<Instant>,
    /// True while the single half-open probe is in flight.
    probe_in_flight: bool,
    /// Rolling `(when, success)` log, trimmed to the monitoring period.
    window: VecDeque<(Instant, bool)>,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    fn new(name: String, settings: BreakerSettings) -> Self {
        Self {
            name,
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                next_half_open_at: None,
                probe_in_flight: false,
                window: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask to make a call through this breaker.
    ///
    /// The guarded call itself happens outside the lock; report the outcome
    /// with [`CircuitBreaker::record`] afterwards.
    pub fn admit(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let due = inner
                    .next_half_open_at
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(true);
                if due {
                    info!(breaker = %self.name, "half-open probe admitted");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CoreError::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CoreError::CircuitOpen {
                        name: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.window.push_back((now, success));
        let cutoff = now.checked_sub(self.settings.monitoring_period);
        if let Some(cutoff) = cutoff {
            while inner.window.front().is_some_and(|(t, _)| *t < cutoff) {
                inner.window.pop_front();
            }
        }

        match inner.state {
            BreakerState::Closed => {
                if success {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.settings.failure_threshold {
                        warn!(
                            breaker = %self.name,
                            failures = inner.consecutive_failures,
                            "breaker tripped open"
                        );
                        inner.state = BreakerState::Open;
                        inner.next_half_open_at = Some(now + self.settings.reset_timeout);
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                if success {
                    info!(breaker = %self.name, "probe succeeded, breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.next_half_open_at = None;
                } else {
                    warn!(breaker = %self.name, "probe failed, breaker re-opened");
                    inner.state = BreakerState::Open;
                    inner.next_half_open_at = Some(now + self.settings.reset_timeout);
                }
            }
            // A late completion from before a manual reset; count it in the
            // window only.
            BreakerState::Open => {}
        }
    }

    /// Release an admission that will never complete (a later gate refused
    /// the call).  Only meaningful for a half-open probe, which must be
    /// handed back so the breaker can admit another probe.
    pub fn cancel_admission(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Force Closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.next_half_open_at = None;
        inner.probe_in_flight = false;
        inner.window.clear();
    }

    pub fn state(&self) -> BreakerState {
        // An elapsed open timer reads as Open until the next admission
        // attempt performs the transition.
        self.inner.lock().unwrap().state
    }

    fn snapshot(&self, scope: BreakerScope) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        let total = inner.window.len();
        let ok = inner.window.iter().filter(|(_, s)| *s).count();
        BreakerSnapshot {
            scope,
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            success_rate: if total == 0 {
                1.0
            } else {
                ok as f64 / total as f64
            },
            next_half_open_in_ms: inner
                .next_half_open_at
                .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as u64),
        }
    }
}

/// Reporting view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub scope: BreakerScope,
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub next_half_open_in_ms: Option<u64>,
}

/// All breakers, keyed by `(scope, name)`; breakers are created on first use.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<(BreakerScope, String), Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            settings: BreakerSettings::from(config),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, scope: BreakerScope, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry((scope, name.to_string()))
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("{scope}:{name}"),
                    self.settings.clone(),
                ))
            })
            .clone()
    }

    /// Force a breaker closed.  No-op when it does not exist yet.
    pub fn reset(&self, scope: BreakerScope, name: &str) {
        if let Some(b) = self.breakers.lock().unwrap().get(&(scope, name.to_string())) {
            b.reset();
        }
    }

    /// Reporting view of every breaker.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap();
        let mut out: Vec<BreakerSnapshot> = breakers
            .iter()
            .map(|((scope, _), b)| b.snapshot(*scope))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, reset_ms: u64) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            monitoring_period: Duration::from_secs(600),
        }
    }

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("model:test".into(), settings(threshold, reset_ms))
    }

    #[test]
    fn closed_admits_and_failures_accumulate() {
        let b = breaker(3, 1000);
        for _ in 0..2 {
            b.admit().unwrap();
            b.record(false);
        }
        assert_eq!(b.state(), BreakerState::Closed);
        b.admit().unwrap();
        b.record(false);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn success_zeroes_consecutive_failures() {
        let b = breaker(3, 1000);
        b.admit().unwrap();
        b.record(false);
        b.admit().unwrap();
        b.record(false);
        b.admit().unwrap();
        b.record(true);
        // Two more failures stay below the threshold again.
        b.admit().unwrap();
        b.record(false);
        b.admit().unwrap();
        b.record(false);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn open_rejects_without_recording() {
        let b = breaker(1, 60_000);
        b.admit().unwrap();
        b.record(false);
        assert_eq!(b.state(), BreakerState::Open);
        let err = b.admit().unwrap_err();
        assert!(matches!(err, CoreError::CircuitOpen { .. }));
    }

    #[test]
    fn open_transitions_to_half_open_after_timeout() {
        let b = breaker(1, 20);
        b.admit().unwrap();
        b.record(false);
        assert!(b.admit().is_err());
        std::thread::sleep(Duration::from_millis(30));
        // First admission after the timeout is the probe.
        b.admit().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Exactly one probe: a second admission is refused while in flight.
        assert!(b.admit().is_err());
    }

    #[test]
    fn half_open_probe_success_closes_and_clears() {
        let b = breaker(1, 10);
        b.admit().unwrap();
        b.record(false);
        std::thread::sleep(Duration::from_millis(20));
        b.admit().unwrap();
        b.record(true);
        assert_eq!(b.state(), BreakerState::Closed);
        // Counter was zeroed: one new failure does not trip a threshold of 1
        // minus previously accumulated state.
        let snap = b.snapshot(BreakerScope::Model);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn half_open_probe_failure_reopens_and_rearms() {
        let b = breaker(1, 10);
        b.admit().unwrap();
        b.record(false);
        std::thread::sleep(Duration::from_millis(20));
        b.admit().unwrap();
        b.record(false);
        assert_eq!(b.state(), BreakerState::Open);
        // Re-armed: immediate admission is refused again.
        assert!(b.admit().is_err());
    }

    #[test]
    fn manual_reset_forces_closed() {
        let b = breaker(1, 60_000);
        b.admit().unwrap();
        b.record(false);
        assert_eq!(b.state(), BreakerState::Open);
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.admit().is_ok());
    }

    #[test]
    fn window_feeds_success_rate_not_transitions() {
        let b = breaker(10, 1000);
        for i in 0..4 {
            b.admit().unwrap();
            b.record(i % 2 == 0);
        }
        let snap = b.snapshot(BreakerScope::Model);
        assert_eq!(snap.state, BreakerState::Closed);
        assert!((snap.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn registry_creates_per_scope_and_name() {
        let reg = BreakerRegistry::new(&BreakerConfig::default());
        let a = reg.get(BreakerScope::Model, "gpt-4o");
        let b = reg.get(BreakerScope::Model, "gpt-4o");
        let c = reg.get(BreakerScope::Agent, "gpt-4o");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c), "scopes are distinct breakers");
        assert_eq!(a.name(), "model:gpt-4o");
        assert_eq!(c.name(), "agent:gpt-4o");
    }

    #[test]
    fn registry_snapshot_lists_all() {
        let reg = BreakerRegistry::new(&BreakerConfig::default());
        reg.get(BreakerScope::Model, "m1");
        reg.get(BreakerScope::Agent, "a1");
        let snaps = reg.snapshot();
        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.state == BreakerState::Closed));
    }
}

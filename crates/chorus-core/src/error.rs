// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy of the orchestration core.
///
/// Retryable provider failures are absorbed by bounded retry and the model
/// fallback chain before any of these surface; per-agent errors appear as
/// `success: false` entries in strategy results rather than aborting the
/// orchestration.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The provider's admission bucket is empty.
    #[error("rate limited, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("authentication failed for provider {provider}")]
    Authentication { provider: String },

    #[error("model {model:?} is not supported (known models: {})", .known.join(", "))]
    ModelNotSupported { model: String, known: Vec<String> },

    #[error("estimated {estimated} tokens exceed the {limit}-token context window")]
    ContextWindowExceeded { estimated: usize, limit: usize },

    #[error("validation error: {0}")]
    Validation(String),

    /// Transport or remote 5xx that survived retries; carries the original
    /// status when one was received.
    #[error("provider {provider} error: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// Admission refused by an open circuit breaker.
    #[error("circuit open: {name}")]
    CircuitOpen { name: String },

    #[error("no agent succeeded before the competitive deadline")]
    CompetitiveTimeout,

    /// Too few successful responses to attempt consensus.
    #[error("consensus not reached: {successes} of {required} required responses")]
    ConsensusNotReached { successes: usize, required: usize },

    #[error("orchestration deadline expired")]
    OrchestrationTimeout,
}

impl CoreError {
    /// Wire-visible error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Authentication { .. } => "authentication",
            Self::ModelNotSupported { .. } => "model_not_supported",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::Validation(_) => "validation",
            Self::Provider { .. } => "provider",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::CompetitiveTimeout => "competitive_timeout",
            Self::ConsensusNotReached { .. } => "consensus_not_reached",
            Self::OrchestrationTimeout => "orchestration_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_not_supported_lists_known_models() {
        let e = CoreError::ModelNotSupported {
            model: "nope".into(),
            known: vec!["gpt-4o".into(), "claude-3-5-sonnet".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("nope"));
        assert!(msg.contains("gpt-4o"));
        assert!(msg.contains("claude-3-5-sonnet"));
    }

    #[test]
    fn context_window_error_carries_both_counts() {
        let e = CoreError::ContextWindowExceeded {
            estimated: 9000,
            limit: 8192,
        };
        let msg = e.to_string();
        assert!(msg.contains("9000"));
        assert!(msg.contains("8192"));
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            CoreError::RateLimited { retry_after: Duration::from_millis(5) }.kind(),
            "rate_limited"
        );
        assert_eq!(CoreError::CompetitiveTimeout.kind(), "competitive_timeout");
        assert_eq!(CoreError::OrchestrationTimeout.kind(), "orchestration_timeout");
    }
}

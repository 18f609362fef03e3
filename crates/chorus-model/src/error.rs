// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use thiserror::Error;

/// Classified provider failure.
///
/// Every adapter maps its wire-level failures into these variants so the
/// service layer can decide uniformly between retry, fallback, and surfacing.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: rate limited")]
    RateLimit {
        provider: String,
        /// Upstream `Retry-After`, when the provider sent one.
        retry_after: Option<Duration>,
    },

    #[error("{provider}: authentication failed: {message}")]
    Authentication { provider: String, message: String },

    #[error("{provider}: request rejected: {message}")]
    Validation { provider: String, message: String },

    #[error("{provider}: context window exceeded: {message}")]
    ContextWindow { provider: String, message: String },

    #[error("{provider}: server error {status}: {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: transport error: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider}: unexpected response: {message}")]
    Unexpected { provider: String, message: String },
}

impl ProviderError {
    /// Wire-visible error kind, one of
    /// `rate_limit | authentication | validation | context_window |
    /// server_error | transport | unknown`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::Authentication { .. } => "authentication",
            Self::Validation { .. } => "validation",
            Self::ContextWindow { .. } => "context_window",
            Self::Server { .. } => "server_error",
            Self::Transport { .. } => "transport",
            Self::Unexpected { .. } => "unknown",
        }
    }

    /// True for failures worth a bounded retry: 429, 5xx, and transport
    /// resets.  Authentication, validation, not-found and context-window
    /// failures are terminal.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::Server { .. } | Self::Transport { .. }
        )
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::RateLimit { provider, .. }
            | Self::Authentication { provider, .. }
            | Self::Validation { provider, .. }
            | Self::ContextWindow { provider, .. }
            | Self::Server { provider, .. }
            | Self::Transport { provider, .. }
            | Self::Unexpected { provider, .. } => provider,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimit { .. } => Some(429),
            Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify a non-2xx HTTP response.
    ///
    /// Some gateways answer an invalid key with a full HTML error page
    /// instead of a JSON body; any HTML-looking body on an error status is
    /// treated as an authentication failure.
    pub fn from_status(
        provider: &str,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let provider = provider.to_string();
        let message = truncate_body(body);

        if looks_like_html(body) {
            return Self::Authentication { provider, message };
        }

        match status {
            429 => Self::RateLimit {
                provider,
                retry_after,
            },
            401 | 403 => Self::Authentication { provider, message },
            400 | 404 | 422 => {
                if mentions_context_window(body) {
                    Self::ContextWindow { provider, message }
                } else {
                    Self::Validation { provider, message }
                }
            }
            500..=599 => Self::Server {
                provider,
                status,
                message,
            },
            _ => Self::Unexpected { provider, message },
        }
    }

    pub fn transport(provider: &str, err: reqwest::Error) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

fn looks_like_html(body: &str) -> bool {
    let t = body.trim_start();
    t.starts_with("<!DOCTYPE") || t.starts_with("<html") || t.starts_with("<HTML")
}

fn mentions_context_window(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context window")
        || lower.contains("context_length")
        || lower.contains("context length")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 400;
    if body.len() > MAX {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &body[..cut])
    } else {
        body.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

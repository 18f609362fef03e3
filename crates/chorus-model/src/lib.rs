// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod credentials;
pub mod registry;
mod adapter;
mod anthropic;
mod error;
mod google;
mod mock;
pub(crate) mod openai_compat;
mod types;

pub use adapter::{ChatAdapter, DeltaStream};
pub use anthropic::AnthropicAdapter;
pub use credentials::{CredentialProvider, EnvCredentials, LayeredCredentials, StaticCredentials};
pub use error::ProviderError;
pub use google::GoogleAdapter;
pub use mock::{FailingAdapter, MockAdapter, ScriptStep, ScriptedAdapter};
pub use openai_compat::{AuthStyle, OpenAiCompatAdapter};
pub use registry::{
    get_provider, known_provider_ids, ModelEntry, ModelRegistry, ProviderMeta, WireFormat,
};
pub use types::*;

use anyhow::bail;
use registry::WireFormat as Wire;

/// Construct a boxed [`ChatAdapter`] for `provider_id`.
///
/// Selects the wire dialect from the provider registry.  `api_key` is the
/// already-resolved credential (see [`credentials`]); `base_url` overrides
/// the registry default.
pub fn build_adapter(
    provider_id: &str,
    api_key: Option<String>,
    base_url: Option<String>,
) -> anyhow::Result<Box<dyn ChatAdapter>> {
    let Some(meta) = get_provider(provider_id) else {
        let known: Vec<&str> = known_provider_ids().collect();
        bail!(
            "unknown provider: {provider_id:?} (known providers: {})",
            known.join(", ")
        );
    };

    match meta.wire {
        Wire::OpenAiCompat => {
            let base = base_url
                .or_else(|| meta.default_base_url.map(String::from))
                .ok_or_else(|| anyhow::anyhow!("provider {provider_id:?} requires a base_url"))?;
            let auth = if api_key.is_some() {
                AuthStyle::Bearer
            } else {
                AuthStyle::None
            };
            let extra_headers = if provider_id == "openrouter" {
                vec![
                    ("HTTP-Referer".into(), "https://github.com/chorus-ai/chorus".into()),
                    ("X-Title".into(), "chorus".into()),
                ]
            } else {
                vec![]
            };
            Ok(Box::new(OpenAiCompatAdapter::new(
                meta.id,
                api_key,
                &base,
                extra_headers,
                auth,
            )))
        }
        Wire::Anthropic => Ok(Box::new(AnthropicAdapter::new(api_key, base_url))),
        Wire::Google => Ok(Box::new(GoogleAdapter::new(api_key, base_url))),
        Wire::Mock => Ok(Box::new(MockAdapter)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_adapter_handles_every_registered_provider() {
        for meta in registry::PROVIDERS {
            let result = build_adapter(meta.id, Some("key".into()), None);
            assert!(result.is_ok(), "provider {} failed: {:?}", meta.id, result.err());
        }
    }

    #[test]
    fn build_adapter_rejects_unknown_provider() {
        let err = build_adapter("made-up-provider", None, None).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
        assert!(err.to_string().contains("openai"), "should list known providers");
    }

    #[test]
    fn keyless_openai_compat_uses_no_auth() {
        // Local servers (ollama) run without a key; the adapter must not
        // demand one at request-build time.
        assert!(build_adapter("ollama", None, None).is_ok());
    }

    #[test]
    fn adapter_reports_its_provider_id() {
        let a = build_adapter("groq", Some("k".into()), None).unwrap();
        assert_eq!(a.provider(), "groq");
        let b = build_adapter("anthropic", Some("k".into()), None).unwrap();
        assert_eq!(b.provider(), "anthropic");
    }
}

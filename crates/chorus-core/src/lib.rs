// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod breaker;
pub mod cache;
pub mod consensus;
pub mod limiter;
pub mod memory;
pub mod prompt;
pub mod tools;
mod error;
mod events;
mod orchestrator;
mod service;
mod session;

pub use breaker::{BreakerRegistry, BreakerScope, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use cache::ResponseCache;
pub use consensus::{consensus_check, ConsensusOutcome};
pub use error::CoreError;
pub use events::{AgentRef, OrchestratorEvent, StageReport, Strategy};
pub use limiter::ProviderLimiter;
pub use memory::MemoryStore;
pub use orchestrator::{
    AgentResult, OrchestrationRequest, OrchestrationSettings, Orchestrator, StrategyOutcome,
};
pub use prompt::{PromptAssembler, PromptContext, Scenario};
pub use service::{ChatCall, ChatOutcome, FallbackHop, LlmService, RetryPolicy};
pub use session::{AgentSpec, Session, SessionStore};
pub use tools::{ToolHandler, ToolNegotiator};

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Strategy execution over a set of agents.
//!
//! One orchestration = one user turn dispatched to the participating agents
//! under a coordination strategy.  Agent calls fan out as child tasks;
//! cancellation propagates downward (dropping the strategy future aborts
//! its `JoinSet`), and every strategy runs under the orchestration
//! deadline.  Per-agent failures are isolated: they surface as
//! `success: false` results and `agent_response_error` events, never as a
//! cancelled orchestration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chorus_config::OrchestratorConfig;
use chorus_model::{ChatMessage, SamplingParams, ToolCall, Usage};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::{
    consensus::consensus_check,
    memory::{EffectivenessInputs, MemoryStore},
    prompt::{PromptAssembler, PromptContext, Scenario},
    service::{ChatCall, ChatOutcome, LlmService},
    session::AgentSpec,
    AgentRef, CoreError, OrchestratorEvent, StageReport, Strategy,
};

/// Per-turn orchestration settings, typically decoded from the client's
/// `chat` envelope.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationSettings {
    pub strategy: Option<Strategy>,
    pub enable_tools: bool,
    /// Sequential: stop at the first failed agent instead of skipping it.
    pub break_on_error: bool,
    /// Pipeline: keep feeding the previous input forward past a failed stage.
    pub pipeline_continue_on_error: bool,
    pub consensus_threshold: Option<f64>,
    pub competitive_timeout_ms: Option<u64>,
    /// Per-agent model overrides, keyed by agent id.
    pub agent_models: HashMap<String, String>,
    pub agent_params: HashMap<String, SamplingParams>,
    pub agent_api_keys: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub session_id: String,
    pub agents: Vec<AgentSpec>,
    pub message: String,
    pub settings: OrchestrationSettings,
}

/// Outcome of one agent call within a strategy.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub agent: AgentRef,
    pub success: bool,
    pub response: Option<String>,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
    pub response_time_ms: u64,
}

/// Per-strategy aggregate result.
#[derive(Debug, Clone)]
pub enum StrategyOutcome {
    Parallel(Vec<AgentResult>),
    Sequential(Vec<AgentResult>),
    Pipeline {
        stages: Vec<StageReport>,
        final_output: String,
    },
    Competitive(AgentResult),
    Consensus {
        reached: bool,
        points: Vec<String>,
        confidence: f64,
        divergent_points: Vec<String>,
        agreement_level: f64,
        participants: Vec<AgentRef>,
    },
}

#[derive(Clone)]
pub struct Orchestrator {
    service: Arc<LlmService>,
    memory: Arc<MemoryStore>,
    prompts: Arc<PromptAssembler>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        service: Arc<LlmService>,
        memory: Arc<MemoryStore>,
        prompts: Arc<PromptAssembler>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            service,
            memory,
            prompts,
            config,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn service(&self) -> &Arc<LlmService> {
        &self.service
    }

    /// Run one user turn.  Emits per-agent and per-strategy events on
    /// `events` in order, finishing with `chat_complete` on success; errors
    /// are returned to the caller, which owns the terminal `error` event.
    pub async fn orchestrate(
        &self,
        req: &OrchestrationRequest,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<StrategyOutcome, CoreError> {
        if req.agents.is_empty() {
            return Err(CoreError::Validation("no agents provided".into()));
        }
        let strategy = req.settings.strategy.unwrap_or(Strategy::Parallel);
        info!(
            session = %req.session_id,
            ?strategy,
            agents = req.agents.len(),
            "orchestration started"
        );

        self.memory.with_conversation(&req.session_id, |c| {
            c.add_message("user", &req.message);
        });

        let deadline = Duration::from_secs(self.config.deadline_secs.max(1));
        let run = self.run_strategy(strategy, req, events);
        let outcome = match tokio::time::timeout(deadline, run).await {
            Ok(result) => result?,
            Err(_) => return Err(CoreError::OrchestrationTimeout),
        };

        let _ = events
            .send(OrchestratorEvent::ChatComplete { strategy })
            .await;
        Ok(outcome)
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        req: &OrchestrationRequest,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<StrategyOutcome, CoreError> {
        match strategy {
            Strategy::Parallel => {
                let results = self
                    .fan_out(req, &req.message, scenario_for(strategy), events)
                    .await;
                Ok(StrategyOutcome::Parallel(results))
            }
            Strategy::Sequential => self.run_sequential(req, events).await,
            Strategy::Pipeline => self.run_pipeline(req, events).await,
            Strategy::Competitive => self.run_competitive(req, events).await,
            Strategy::Consensus => self.run_consensus(req, events).await,
        }
    }

    // ── Parallel fan-out (also the consensus dispatch primitive) ─────────────

    /// Dispatch one call per agent concurrently and wait for all of them.
    /// Events are emitted in completion order; the returned list keeps the
    /// declared agent order.
    async fn fan_out(
        &self,
        req: &OrchestrationRequest,
        message: &str,
        scenario: Option<Scenario>,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Vec<AgentResult> {
        let mut set: JoinSet<(usize, Result<ChatOutcome, CoreError>, u64)> = JoinSet::new();
        for (idx, agent) in req.agents.iter().enumerate() {
            let call = self.plan_call(
                req,
                agent,
                scenario,
                vec![ChatMessage::user(message.to_string())],
            );
            let service = Arc::clone(&self.service);
            set.spawn(async move {
                let started = Instant::now();
                let result = service.chat(&call).await;
                (idx, result, started.elapsed().as_millis() as u64)
            });
        }

        let mut slots: Vec<Option<AgentResult>> = vec![None; req.agents.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result, elapsed_ms)) => {
                    let agent = &req.agents[idx];
                    let r = self
                        .settle_agent_result(req, agent, result, elapsed_ms, events)
                        .await;
                    slots[idx] = Some(r);
                }
                // A panicked child never takes the others down.
                Err(join_err) => {
                    debug!(error = %join_err, "agent task failed to join");
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| failed_result(&req.agents[idx], "agent task panicked"))
            })
            .collect()
    }

    /// Translate a service result into an [`AgentResult`], emit its events,
    /// and record the response in conversation memory.
    async fn settle_agent_result(
        &self,
        req: &OrchestrationRequest,
        agent: &AgentSpec,
        result: Result<ChatOutcome, CoreError>,
        elapsed_ms: u64,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> AgentResult {
        let agent_ref = agent.agent_ref();
        match result {
            Ok(outcome) => {
                for hop in &outcome.fallbacks {
                    let _ = events
                        .send(OrchestratorEvent::ModelFallback {
                            agent: agent_ref.clone(),
                            from: hop.from.clone(),
                            to: hop.to.clone(),
                        })
                        .await;
                }
                self.memory.with_conversation(&req.session_id, |c| {
                    c.add_message(&agent.id, &outcome.content);
                });
                let _ = events
                    .send(OrchestratorEvent::AgentResponse {
                        agent: agent_ref.clone(),
                        response: outcome.content.clone(),
                        response_time_ms: elapsed_ms,
                        usage: Some(outcome.usage),
                        tool_calls: outcome.tool_calls.clone(),
                    })
                    .await;
                AgentResult {
                    agent: agent_ref,
                    success: true,
                    response: Some(outcome.content),
                    usage: Some(outcome.usage),
                    tool_calls: outcome.tool_calls,
                    error: None,
                    response_time_ms: elapsed_ms,
                }
            }
            Err(e) => {
                let _ = events
                    .send(OrchestratorEvent::AgentResponseError {
                        agent: agent_ref.clone(),
                        error: e.to_string(),
                    })
                    .await;
                AgentResult {
                    agent: agent_ref,
                    success: false,
                    response: None,
                    usage: None,
                    tool_calls: Vec::new(),
                    error: Some(e.to_string()),
                    response_time_ms: elapsed_ms,
                }
            }
        }
    }

    // ── Sequential ────────────────────────────────────────────────────────────

    /// Agents run in declared order over an evolving transcript: each
    /// successful agent's reply is appended, tagged with its name, before
    /// the next agent runs.
    async fn run_sequential(
        &self,
        req: &OrchestrationRequest,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<StrategyOutcome, CoreError> {
        let scenario = scenario_for(Strategy::Sequential);
        let mut transcript = vec![ChatMessage::user(req.message.clone())];
        let mut results = Vec::with_capacity(req.agents.len());

        for agent in &req.agents {
            let call = self.plan_call(req, agent, scenario, transcript.clone());
            let started = Instant::now();
            let result = self.service.chat(&call).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let settled = self
                .settle_agent_result(req, agent, result, elapsed_ms, events)
                .await;

            if let Some(text) = &settled.response {
                transcript.push(ChatMessage::assistant_from(&agent.name, text.clone()));
            }
            let stop = !settled.success && req.settings.break_on_error;
            results.push(settled);
            if stop {
                break;
            }
        }

        Ok(StrategyOutcome::Sequential(results))
    }

    // ── Pipeline ──────────────────────────────────────────────────────────────

    /// Each agent sees only the current input as its user turn; its output
    /// becomes the next stage's input.
    async fn run_pipeline(
        &self,
        req: &OrchestrationRequest,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<StrategyOutcome, CoreError> {
        let scenario = scenario_for(Strategy::Pipeline);
        let mut input = req.message.clone();
        let mut stages: Vec<StageReport> = Vec::with_capacity(req.agents.len());
        let mut final_output = String::new();

        for agent in &req.agents {
            let call = self.plan_call(
                req,
                agent,
                scenario,
                vec![ChatMessage::user(input.clone())],
            );
            let started = Instant::now();
            let result = self.service.chat(&call).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let settled = self
                .settle_agent_result(req, agent, result, elapsed_ms, events)
                .await;

            if let Some(output) = &settled.response {
                stages.push(StageReport {
                    agent: agent.agent_ref(),
                    input: input.clone(),
                    output: Some(output.clone()),
                    error: None,
                });
                final_output = output.clone();
                input = output.clone();
            } else {
                stages.push(StageReport {
                    agent: agent.agent_ref(),
                    input: input.clone(),
                    output: None,
                    error: settled.error.clone(),
                });
                if !req.settings.pipeline_continue_on_error {
                    break;
                }
            }
        }

        let _ = events
            .send(OrchestratorEvent::PipelineResult {
                pipeline: stages.clone(),
                final_output: final_output.clone(),
            })
            .await;
        Ok(StrategyOutcome::Pipeline {
            stages,
            final_output,
        })
    }

    // ── Competitive ───────────────────────────────────────────────────────────

    /// All agents race; the first success wins and the losers are aborted.
    /// Losing or failing agents emit no events.
    async fn run_competitive(
        &self,
        req: &OrchestrationRequest,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<StrategyOutcome, CoreError> {
        let scenario = scenario_for(Strategy::Competitive);
        let timeout_ms = req
            .settings
            .competitive_timeout_ms
            .unwrap_or(self.config.competitive_timeout_ms);
        let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);

        let mut set: JoinSet<(usize, Result<ChatOutcome, CoreError>, u64)> = JoinSet::new();
        for (idx, agent) in req.agents.iter().enumerate() {
            let call = self.plan_call(
                req,
                agent,
                scenario,
                vec![ChatMessage::user(req.message.clone())],
            );
            let service = Arc::clone(&self.service);
            set.spawn(async move {
                let started = Instant::now();
                let result = service.chat(&call).await;
                (idx, result, started.elapsed().as_millis() as u64)
            });
        }

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    set.abort_all();
                    return Err(CoreError::CompetitiveTimeout);
                }
                joined = set.join_next() => match joined {
                    // Every agent finished without a success.
                    None => return Err(CoreError::CompetitiveTimeout),
                    Some(Ok((idx, Ok(outcome), elapsed_ms))) => {
                        set.abort_all();
                        let agent = &req.agents[idx];
                        let winner = self
                            .settle_agent_result(req, agent, Ok(outcome), elapsed_ms, events)
                            .await;
                        return Ok(StrategyOutcome::Competitive(winner));
                    }
                    // Failed racers are silent; the race continues.
                    Some(Ok((_, Err(_), _))) | Some(Err(_)) => continue,
                }
            }
        }
    }

    // ── Consensus ─────────────────────────────────────────────────────────────

    async fn run_consensus(
        &self,
        req: &OrchestrationRequest,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<StrategyOutcome, CoreError> {
        let threshold = req
            .settings
            .consensus_threshold
            .unwrap_or(self.config.consensus_threshold);
        let required = ((threshold * req.agents.len() as f64).ceil() as usize).max(1);

        let mut message = req.message.clone();
        let mut last_divergent: Vec<String> = Vec::new();
        let mut last_agreement = 0.0;

        for iteration in 0..self.config.max_consensus_iterations.max(1) {
            debug!(iteration, "consensus round");
            let results = self
                .fan_out(req, &message, Some(Scenario::Consensus), events)
                .await;
            let successes: Vec<&AgentResult> =
                results.iter().filter(|r| r.success).collect();
            if successes.len() < required {
                return Err(CoreError::ConsensusNotReached {
                    successes: successes.len(),
                    required,
                });
            }

            let texts: Vec<String> = successes
                .iter()
                .filter_map(|r| r.response.clone())
                .collect();
            let outcome = consensus_check(&texts);
            last_agreement = outcome.agreement_level;

            if outcome.reached || outcome.agreed_by_phrase() {
                let participants: Vec<AgentRef> =
                    successes.iter().map(|r| r.agent.clone()).collect();
                let sources: Vec<String> =
                    participants.iter().map(|p| p.name.clone()).collect();
                self.memory.with_meta(|meta| {
                    for point in &outcome.points {
                        meta.add_shared_fact(point.clone(), outcome.confidence, sources.clone());
                    }
                    meta.update_effectiveness(EffectivenessInputs {
                        consensus_rate: 1.0,
                        goal_progress: 0.0,
                        participation_balance: successes.len() as f64
                            / req.agents.len() as f64,
                    });
                });

                let _ = events
                    .send(OrchestratorEvent::ConsensusResult {
                        reached: true,
                        points: Some(outcome.points.clone()),
                        confidence: Some(outcome.confidence),
                        divergent_points: None,
                        agreement_level: outcome.agreement_level,
                    })
                    .await;
                return Ok(StrategyOutcome::Consensus {
                    reached: true,
                    points: outcome.points,
                    confidence: outcome.confidence,
                    divergent_points: Vec::new(),
                    agreement_level: outcome.agreement_level,
                    participants,
                });
            }

            last_divergent = outcome.divergent_points;
            message = combined_viewpoint_prompt(&req.message, &successes);
        }

        // Exhausted iterations: a normal outcome, not an error.
        self.memory.with_meta(|meta| {
            meta.update_effectiveness(EffectivenessInputs {
                consensus_rate: 0.0,
                goal_progress: 0.0,
                participation_balance: 1.0,
            });
        });
        let _ = events
            .send(OrchestratorEvent::ConsensusResult {
                reached: false,
                points: None,
                confidence: None,
                divergent_points: Some(last_divergent.clone()),
                agreement_level: last_agreement,
            })
            .await;
        Ok(StrategyOutcome::Consensus {
            reached: false,
            points: Vec::new(),
            confidence: 0.0,
            divergent_points: last_divergent,
            agreement_level: last_agreement,
            participants: req.agents.iter().map(|a| a.agent_ref()).collect(),
        })
    }

    // ── Call planning ─────────────────────────────────────────────────────────

    /// Build the service call for one agent: assembled system prompt,
    /// per-agent overrides, breaker names and credentials.
    fn plan_call(
        &self,
        req: &OrchestrationRequest,
        agent: &AgentSpec,
        scenario: Option<Scenario>,
        messages: Vec<ChatMessage>,
    ) -> ChatCall {
        let ctx = self.prompt_context(&req.session_id, agent);
        let system = self.prompts.assemble(&agent.id, scenario, &ctx);

        let model = req
            .settings
            .agent_models
            .get(&agent.id)
            .cloned()
            .unwrap_or_else(|| agent.model.clone());
        let params = req
            .settings
            .agent_params
            .get(&agent.id)
            .cloned()
            .unwrap_or_else(|| agent.params.clone());

        ChatCall {
            model,
            messages,
            system,
            params,
            enable_tools: req.settings.enable_tools,
            archetype: agent.archetype.clone(),
            agent_breaker: Some(agent.id.clone()),
            api_key: req.settings.agent_api_keys.get(&agent.id).cloned(),
        }
    }

    /// Fill the prompt context from the three memory tiers.
    fn prompt_context(&self, session_id: &str, agent: &AgentSpec) -> PromptContext {
        let (user_context, current_goals, shared_knowledge) = self.memory.read_meta(|meta| {
            let user_context = if meta.user_profile.highlights.is_empty() {
                String::new()
            } else {
                meta.user_profile.highlights.join("; ")
            };
            let goals: Vec<String> = meta
                .short_term_goals
                .iter()
                .chain(&meta.long_term_goals)
                .map(|g| format!("{} ({:.0}%)", g.text, g.progress))
                .collect();
            let mut facts: Vec<&String> = meta.facts.keys().collect();
            facts.sort();
            let knowledge = facts
                .into_iter()
                .take(5)
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");
            (user_context, goals.join("; "), knowledge)
        });

        let session_context = self.memory.read_conversation(session_id, |conv| {
            conv.map(|c| {
                let ctx = c.get_context(5);
                let mut parts = Vec::new();
                if !ctx.recent_topics.is_empty() {
                    parts.push(format!("recent topics: {}", ctx.recent_topics.join(", ")));
                }
                if !ctx.avoided_topics.is_empty() {
                    parts.push(format!(
                        "avoid revisiting: {}",
                        ctx.avoided_topics.join(", ")
                    ));
                }
                parts.join("; ")
            })
            .unwrap_or_default()
        });

        let (personality_traits, preferences, emotional_state) =
            self.memory.read_model(&agent.id, |m| {
                m.map(|m| {
                    let traits = m
                        .traits
                        .iter()
                        .map(|(k, t)| format!("{k}: {}", t.value))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let prefs = m
                        .preferences
                        .iter()
                        .map(|(k, p)| format!("{k}: {}", p.value))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let emotions = m
                        .emotions
                        .iter()
                        .map(|(k, v)| format!("{k}={v:.2}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    (traits, prefs, emotions)
                })
                .unwrap_or_default()
            });

        PromptContext {
            user_context,
            current_goals,
            shared_knowledge,
            session_context,
            agent_name: agent.name.clone(),
            role: agent.archetype.clone().unwrap_or_default(),
            expertise: String::new(),
            style: String::new(),
            personality_traits,
            preferences,
            emotional_state,
            special_instructions: agent.system_prompt.clone().unwrap_or_default(),
        }
    }
}

fn scenario_for(strategy: Strategy) -> Option<Scenario> {
    match strategy {
        Strategy::Parallel | Strategy::Sequential => Some(Scenario::Collaboration),
        Strategy::Pipeline => Some(Scenario::Analysis),
        Strategy::Competitive => Some(Scenario::Creativity),
        Strategy::Consensus => Some(Scenario::Consensus),
    }
}

fn failed_result(agent: &AgentSpec, error: &str) -> AgentResult {
    AgentResult {
        agent: agent.agent_ref(),
        success: false,
        response: None,
        usage: None,
        tool_calls: Vec::new(),
        error: Some(error.to_string()),
        response_time_ms: 0,
    }
}

/// Re-dispatch prompt for the next consensus round: the original question
/// plus every agent's position, asking for synthesis.
fn combined_viewpoint_prompt(original: &str, successes: &[&AgentResult]) -> String {
    let mut prompt = format!(
        "The team is trying to reach consensus on: {original}\n\nPositions so far:\n"
    );
    for r in successes {
        if let Some(text) = &r.response {
            prompt.push_str(&format!("- {}: {}\n", r.agent.name, text));
        }
    }
    prompt.push_str(
        "\nConsider the other positions and restate your view, moving toward common ground.",
    );
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

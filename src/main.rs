// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use chorus_core::{LlmService, MemoryStore, Orchestrator, PromptAssembler, ToolNegotiator};
use chorus_gateway::Gateway;
use chorus_model::{registry, EnvCredentials, ModelRegistry};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = chorus_config::load(cli.config.as_deref())?;

    match cli.command.as_ref() {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::ListProviders) => {
            for p in registry::PROVIDERS {
                println!(
                    "{:<12} {:<16} key: {}",
                    p.id,
                    p.name,
                    p.default_api_key_env.unwrap_or("-"),
                );
            }
            Ok(())
        }
        Some(Commands::ListModels) => {
            let models =
                ModelRegistry::from_config(&config.models, &config.fallbacks).map_err(anyhow::Error::msg)?;
            for name in models.known_models() {
                let Some(entry) = models.get(&name) else { continue };
                let chain = models.fallback_chain(&name);
                print!(
                    "{:<28} {:<12} window: {:>9}",
                    entry.model, entry.provider, entry.context_window_tokens,
                );
                if chain.is_empty() {
                    println!();
                } else {
                    println!("  fallbacks: {}", chain.join(" → "));
                }
            }
            Ok(())
        }
        Some(Commands::Serve { bind }) => serve(config, bind.clone()).await,
        None => serve(config, None).await,
    }
}

async fn serve(config: chorus_config::Config, bind_override: Option<String>) -> anyhow::Result<()> {
    let models = ModelRegistry::from_config(&config.models, &config.fallbacks)
        .map_err(anyhow::Error::msg)
        .context("invalid model registry configuration")?;

    let credential_envs: HashMap<String, String> = config
        .providers
        .iter()
        .filter_map(|(id, p)| p.api_key_env.clone().map(|env| (id.clone(), env)))
        .collect();
    let credentials = Arc::new(EnvCredentials::new(credential_envs));

    let negotiator = Arc::new(ToolNegotiator::new());
    let prompts = Arc::new(PromptAssembler::new());
    let memory = Arc::new(MemoryStore::load(config.memory.clone(), &prompts));

    let service = Arc::new(LlmService::new(
        models,
        &config,
        credentials,
        Arc::clone(&negotiator),
    ));
    let orchestrator = Orchestrator::new(
        Arc::clone(&service),
        Arc::clone(&memory),
        Arc::clone(&prompts),
        config.orchestrator.clone(),
    );

    let gateway = Arc::new(Gateway::new(orchestrator, &config.gateway));

    // Background maintenance: TTL sweep, memory autosave, idle-session reap.
    let sweeper = service
        .cache()
        .spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs.max(1)));
    let autosave = memory.spawn_autosave(Arc::clone(&prompts));
    let reaper = gateway.spawn_session_reaper(Duration::from_secs(60));

    let bind = bind_override.unwrap_or_else(|| config.gateway.bind.clone());
    let result = tokio::select! {
        r = chorus_gateway::serve(Arc::clone(&gateway), &bind) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    sweeper.abort();
    autosave.abort();
    reaper.abort();
    memory
        .save(&prompts)
        .context("saving memory on shutdown")?;
    result
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chorus={default_level},warn")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

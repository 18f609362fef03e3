// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "chorus",
    about = "Multi-provider LLM orchestration server",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the default search path)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the WebSocket gateway (the default when no command is given)
    Serve {
        /// Bind address override, e.g. 0.0.0.0:7070
        #[arg(long)]
        bind: Option<String>,
    },
    /// List registered models with provider bindings and context windows
    ListModels,
    /// List supported providers and their credential environment variables
    ListProviders,
    /// Print the effective merged configuration as YAML
    ShowConfig,
}

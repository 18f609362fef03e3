// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! WebSocket gateway: accepts client connections, dispatches chat
//! envelopes through the orchestrator, and streams structured events back.

mod connections;
mod protocol;
mod ws;

pub use connections::{next_outbound, ClientShared, ConnectResult, ConnectionRegistry};
pub use protocol::{ChatPayload, ClientEnvelope, Outbound, ServerEvent, SettingsPayload};

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tracing::info;

use chorus_config::GatewayConfig;
use chorus_core::{Orchestrator, SessionStore};

pub struct Gateway {
    pub orchestrator: Orchestrator,
    pub sessions: SessionStore,
    pub connections: ConnectionRegistry,
}

impl Gateway {
    pub fn new(orchestrator: Orchestrator, config: &GatewayConfig) -> Self {
        Self {
            orchestrator,
            sessions: SessionStore::new(Duration::from_secs(config.session_idle_secs)),
            connections: ConnectionRegistry::new(config.queue_capacity),
        }
    }

    /// Status snapshot for `get-status`.
    pub fn status_snapshot(&self) -> ServerEvent {
        let agents = self
            .sessions
            .ids()
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter_map(|s| s.try_lock().map(|g| g.participants.len()).ok())
            .sum();
        ServerEvent::Status {
            agents,
            active_conversations: self.sessions.len(),
            connected_clients: self.connections.connected_clients(),
            uptime_seconds: self.connections.uptime_seconds(),
        }
    }

    /// Drop idle sessions and their conversation memory on a fixed period.
    pub fn spawn_session_reaper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for expired in gateway.sessions.expire_idle() {
                    info!(session = %expired, "idle session expired");
                    gateway.orchestrator.memory().drop_conversation(&expired);
                }
            }
        })
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(gateway)
}

/// Bind and serve until the task is cancelled.
pub async fn serve(gateway: Arc<Gateway>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "gateway listening");
    axum::serve(listener, router(gateway)).await?;
    Ok(())
}

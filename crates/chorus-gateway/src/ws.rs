// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! WebSocket bridge — one socket per client, JSON text frames.
//!
//! The handler owns the read side; the write side drains the client's
//! persistent outbound queue (see `connections`).  Dispatching a `chat`
//! envelope spawns a task so slow orchestrations never block the reader;
//! within one session, chats are serialized by the session lock.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_core::{CoreError, OrchestrationRequest, StrategyOutcome};
use chorus_model::ChatMessage;

use crate::{
    connections::next_outbound,
    protocol::{ChatPayload, ClientEnvelope, Outbound, ServerEvent, StartConversationPayload},
    Gateway,
};

/// HTTP handler for `GET /ws`.
///
/// The client identity comes from the `userId` query parameter, the
/// `x-user-id` header, or is generated fresh.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(gateway): State<Arc<Gateway>>,
) -> Response {
    let user_id = params
        .get("userId")
        .cloned()
        .or_else(|| {
            headers
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, user_id))
}

pub async fn handle_socket(mut socket: WebSocket, gateway: Arc<Gateway>, user_id: String) {
    let conn = gateway.connections.connect(&user_id);
    info!(user_id, reconnection = conn.is_reconnection, "client connected");

    gateway.connections.send(
        &user_id,
        Outbound::Gateway(ServerEvent::Connected {
            user_id: user_id.clone(),
            is_reconnection: conn.is_reconnection.then_some(true),
            agents: connected_agent_ids(&gateway, &conn.sessions).await,
        }),
    );

    let epoch = conn.epoch;
    let shared = conn.shared;
    loop {
        tokio::select! {
            // Outgoing: drain the persistent per-user queue.
            outbound = next_outbound(&shared, epoch) => {
                match outbound {
                    Some(ev) => {
                        if let Some(json) = ev.to_json() {
                            if socket.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    // Displaced by a reconnection, or close requested.
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            // Incoming: client envelopes.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_envelope(&gateway, &user_id, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(user_id, error = %e, "websocket recv error");
                        break;
                    }
                }
            }
        }
    }

    gateway.connections.detach(&user_id, epoch);
    debug!(user_id, "socket closed");
}

async fn handle_envelope(gateway: &Arc<Gateway>, user_id: &str, text: &str) {
    match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(ClientEnvelope::Chat { payload }) => {
            // Run the orchestration off the reader loop; the session lock
            // serializes turns within one session.
            let gateway = Arc::clone(gateway);
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                dispatch_chat(gateway, user_id, payload).await;
            });
        }
        Ok(ClientEnvelope::StartConversation { payload }) => {
            start_conversation(gateway, user_id, payload);
        }
        Ok(ClientEnvelope::GetStatus) => {
            gateway
                .connections
                .send(user_id, Outbound::Gateway(gateway.status_snapshot()));
        }
        // Unknown or malformed envelope types are session-fatal.
        Err(e) => {
            warn!(user_id, error = %e, "unparseable client envelope");
            gateway.connections.send(
                user_id,
                Outbound::Gateway(ServerEvent::Error {
                    error: format!("invalid message: {e}"),
                    recoverable: false,
                }),
            );
        }
    }
}

async fn dispatch_chat(gateway: Arc<Gateway>, user_id: String, payload: ChatPayload) {
    let settings = match payload.settings.decode() {
        Ok(s) => s,
        Err(e) => {
            gateway.connections.send(
                &user_id,
                Outbound::Gateway(ServerEvent::Error {
                    error: e.to_string(),
                    recoverable: false,
                }),
            );
            return;
        }
    };

    let session = gateway
        .sessions
        .get_or_create(&payload.session_id, &payload.agents);
    gateway
        .connections
        .add_session(&user_id, &payload.session_id);

    // Holding the session lock across the orchestration serializes turns
    // within this session; other sessions proceed independently.
    let mut session_guard = session.lock().await;
    session_guard.push(ChatMessage::user(payload.message.clone()));

    let (tx, mut rx) = mpsc::channel(64);
    let forwarder = {
        let gateway = Arc::clone(&gateway);
        let user_id = user_id.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                gateway
                    .connections
                    .send(&user_id, Outbound::Orchestration(ev));
            }
        })
    };

    let req = OrchestrationRequest {
        session_id: payload.session_id.clone(),
        agents: payload.agents,
        message: payload.message,
        settings,
    };
    match gateway.orchestrator.orchestrate(&req, &tx).await {
        Ok(outcome) => record_turns(&mut session_guard, &outcome),
        Err(e) => {
            gateway.connections.send(
                &user_id,
                Outbound::Gateway(ServerEvent::Error {
                    error: e.to_string(),
                    recoverable: recoverable(&e),
                }),
            );
        }
    }
    drop(tx);
    let _ = forwarder.await;
}

/// Append the strategy's assistant turns to the session transcript.
fn record_turns(session: &mut chorus_core::Session, outcome: &StrategyOutcome) {
    match outcome {
        StrategyOutcome::Parallel(results) | StrategyOutcome::Sequential(results) => {
            for r in results {
                if let Some(text) = &r.response {
                    session.push(ChatMessage::assistant_from(&r.agent.name, text.clone()));
                }
            }
        }
        StrategyOutcome::Pipeline { final_output, .. } => {
            if !final_output.is_empty() {
                session.push(ChatMessage::assistant(final_output.clone()));
            }
        }
        StrategyOutcome::Competitive(winner) => {
            if let Some(text) = &winner.response {
                session.push(ChatMessage::assistant_from(&winner.agent.name, text.clone()));
            }
        }
        StrategyOutcome::Consensus { points, .. } => {
            if !points.is_empty() {
                session.push(ChatMessage::assistant(points.join("; ")));
            }
        }
    }
}

/// Orchestration failures leave the session usable; only dispatch-level
/// protocol violations are fatal (handled where they are detected).
fn recoverable(e: &CoreError) -> bool {
    !matches!(e, CoreError::Validation(_))
}

fn start_conversation(gateway: &Arc<Gateway>, user_id: &str, payload: StartConversationPayload) {
    let session = gateway
        .sessions
        .get_or_create(&payload.session_id, &payload.agents);
    gateway
        .connections
        .add_session(user_id, &payload.session_id);
    if let Some(topic) = &payload.topic {
        gateway
            .orchestrator
            .memory()
            .with_conversation(&payload.session_id, |c| {
                c.add_message("user", &format!("Let's talk about {topic}"));
            });
    }
    let agents = {
        // The session was just created (or already live); read participants
        // for the event without blocking the dispatch path.
        match session.try_lock() {
            Ok(s) => s.participants.iter().map(|a| a.agent_ref()).collect(),
            Err(_) => payload.agents.iter().map(|a| a.agent_ref()).collect(),
        }
    };
    gateway.connections.send(
        user_id,
        Outbound::Gateway(ServerEvent::ConversationStart {
            session_id: payload.session_id,
            agents,
        }),
    );
}

async fn connected_agent_ids(gateway: &Arc<Gateway>, sessions: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for sid in sessions {
        if let Some(session) = gateway.sessions.get(sid) {
            if let Ok(s) = session.try_lock() {
                out.extend(s.participants.iter().map(|a| a.id.clone()));
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-client connection state.
//!
//! Each `userId` owns one bounded outbound queue that outlives individual
//! sockets: a reconnecting client picks up the queue where the old socket
//! left it, so an in-flight orchestration's remaining events reach the new
//! socket in their original relative order.  Sockets are distinguished by
//! an epoch; a reconnection bumps the epoch and wakes the old writer so it
//! exits.
//!
//! Backpressure: when the queue is full, droppable events (status,
//! fallback notices) are shed first — the incoming one, then queued ones.
//! If a critical event still cannot be queued, the connection is marked for
//! close; losing a `chat_complete` silently is worse than losing the
//! connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::warn;

use crate::protocol::Outbound;

pub struct ClientState {
    queue: VecDeque<Outbound>,
    pub sessions: HashSet<String>,
    pub epoch: u64,
    /// Set when a critical event could not be queued; the writer closes the
    /// socket when it observes this.
    pub close_requested: bool,
    /// Whether a socket is currently attached.
    pub attached: bool,
}

pub struct ClientShared {
    pub state: Mutex<ClientState>,
    pub notify: Notify,
}

pub struct ConnectResult {
    pub shared: Arc<ClientShared>,
    pub epoch: u64,
    pub is_reconnection: bool,
    pub sessions: Vec<String>,
}

pub struct ConnectionRegistry {
    clients: Mutex<HashMap<String, Arc<ClientShared>>>,
    queue_capacity: usize,
    started_at: Instant,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            started_at: Instant::now(),
        }
    }

    /// Attach a socket for `user_id`.  A previously seen id is a
    /// reconnection: the existing queue and session set are inherited and
    /// the old writer (if any) is displaced via the epoch bump.
    pub fn connect(&self, user_id: &str) -> ConnectResult {
        let mut clients = self.clients.lock().unwrap();
        match clients.get(user_id) {
            Some(shared) => {
                let shared = Arc::clone(shared);
                let (epoch, sessions) = {
                    let mut st = shared.state.lock().unwrap();
                    st.epoch += 1;
                    st.attached = true;
                    st.close_requested = false;
                    (st.epoch, st.sessions.iter().cloned().collect())
                };
                // Wake the displaced writer so it notices the epoch change.
                shared.notify.notify_waiters();
                ConnectResult {
                    shared,
                    epoch,
                    is_reconnection: true,
                    sessions,
                }
            }
            None => {
                let shared = Arc::new(ClientShared {
                    state: Mutex::new(ClientState {
                        queue: VecDeque::new(),
                        sessions: HashSet::new(),
                        epoch: 0,
                        close_requested: false,
                        attached: true,
                    }),
                    notify: Notify::new(),
                });
                clients.insert(user_id.to_string(), Arc::clone(&shared));
                ConnectResult {
                    shared,
                    epoch: 0,
                    is_reconnection: false,
                    sessions: Vec::new(),
                }
            }
        }
    }

    /// Mark the socket detached (client went away).  The queue is kept for
    /// a possible reconnection.
    pub fn detach(&self, user_id: &str, epoch: u64) {
        if let Some(shared) = self.clients.lock().unwrap().get(user_id) {
            let mut st = shared.state.lock().unwrap();
            if st.epoch == epoch {
                st.attached = false;
            }
        }
    }

    /// Queue an event for a client.  Returns false when the client is
    /// unknown or the event was shed.
    pub fn send(&self, user_id: &str, ev: Outbound) -> bool {
        let shared = match self.clients.lock().unwrap().get(user_id) {
            Some(s) => Arc::clone(s),
            None => return false,
        };
        let mut st = shared.state.lock().unwrap();

        if st.queue.len() >= self.queue_capacity {
            if ev.droppable() {
                return false;
            }
            // Shed queued droppable events to make room for a critical one.
            if let Some(pos) = st.queue.iter().position(|e| e.droppable()) {
                st.queue.remove(pos);
            } else {
                warn!(user_id, "outbound queue full of critical events, closing");
                st.close_requested = true;
                drop(st);
                shared.notify.notify_one();
                return false;
            }
        }
        st.queue.push_back(ev);
        drop(st);
        shared.notify.notify_one();
        true
    }

    pub fn add_session(&self, user_id: &str, session_id: &str) {
        if let Some(shared) = self.clients.lock().unwrap().get(user_id) {
            shared
                .state
                .lock()
                .unwrap()
                .sessions
                .insert(session_id.to_string());
        }
    }

    pub fn sessions_of(&self, user_id: &str) -> Vec<String> {
        self.clients
            .lock()
            .unwrap()
            .get(user_id)
            .map(|s| s.state.lock().unwrap().sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clients with a socket currently attached.
    pub fn connected_clients(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state.lock().unwrap().attached)
            .count()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Pop the next outbound event for a writer at `epoch`, waiting when the
/// queue is empty.  Returns `None` when the writer was displaced by a
/// reconnection or the connection should close.
pub async fn next_outbound(shared: &ClientShared, epoch: u64) -> Option<Outbound> {
    loop {
        {
            let mut st = shared.state.lock().unwrap();
            if st.epoch != epoch || st.close_requested {
                return None;
            }
            if let Some(ev) = st.queue.pop_front() {
                return Some(ev);
            }
        }
        shared.notify.notified().await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;
    use chorus_core::{AgentRef, OrchestratorEvent, Strategy};

    fn critical() -> Outbound {
        Outbound::Orchestration(OrchestratorEvent::ChatComplete {
            strategy: Strategy::Parallel,
        })
    }

    fn droppable() -> Outbound {
        Outbound::Orchestration(OrchestratorEvent::ModelFallback {
            agent: AgentRef { id: "a".into(), name: "A".into() },
            from: "m1".into(),
            to: "m2".into(),
        })
    }

    #[test]
    fn first_connect_is_not_a_reconnection() {
        let reg = ConnectionRegistry::new(8);
        let c = reg.connect("u1");
        assert!(!c.is_reconnection);
        assert_eq!(c.epoch, 0);
        assert_eq!(reg.connected_clients(), 1);
    }

    #[test]
    fn reconnect_inherits_sessions_and_bumps_epoch() {
        let reg = ConnectionRegistry::new(8);
        let first = reg.connect("u1");
        reg.add_session("u1", "s1");
        reg.detach("u1", first.epoch);
        assert_eq!(reg.connected_clients(), 0);

        let second = reg.connect("u1");
        assert!(second.is_reconnection);
        assert_eq!(second.epoch, 1);
        assert_eq!(second.sessions, vec!["s1".to_string()]);
        assert_eq!(reg.connected_clients(), 1);
    }

    #[tokio::test]
    async fn queued_events_survive_reconnection_in_order() {
        let reg = ConnectionRegistry::new(8);
        let first = reg.connect("u1");
        // Events queued while the first socket is attached but not reading.
        assert!(reg.send("u1", critical()));
        assert!(reg.send("u1", droppable()));
        reg.detach("u1", first.epoch);

        let second = reg.connect("u1");
        // Old-epoch writer is displaced immediately.
        assert!(next_outbound(&first.shared, first.epoch).await.is_none());
        // New writer drains the same queue in order.
        let a = next_outbound(&second.shared, second.epoch).await.unwrap();
        assert!(matches!(a, Outbound::Orchestration(OrchestratorEvent::ChatComplete { .. })));
        let b = next_outbound(&second.shared, second.epoch).await.unwrap();
        assert!(matches!(b, Outbound::Orchestration(OrchestratorEvent::ModelFallback { .. })));
    }

    #[test]
    fn full_queue_drops_droppable_incoming_first() {
        let reg = ConnectionRegistry::new(2);
        let c = reg.connect("u1");
        assert!(reg.send("u1", critical()));
        assert!(reg.send("u1", critical()));
        // Queue full: a droppable incoming event is shed.
        assert!(!reg.send("u1", droppable()));
        assert!(!c.shared.state.lock().unwrap().close_requested);
        // A critical incoming event with no queued droppable to shed marks
        // the connection for close.
        assert!(!reg.send("u1", critical()));
        assert!(c.shared.state.lock().unwrap().close_requested);
    }

    #[test]
    fn full_queue_sheds_queued_droppable_for_critical() {
        let reg = ConnectionRegistry::new(2);
        reg.connect("u1");
        assert!(reg.send("u1", droppable()));
        assert!(reg.send("u1", critical()));
        // Full; the queued droppable makes room for the critical event.
        assert!(reg.send("u1", critical()));
        let shared = reg.connect("u1").shared;
        let st = shared.state.lock().unwrap();
        assert_eq!(st.queue.len(), 2);
        assert!(st.queue.iter().all(|e| !e.droppable()));
        assert!(!st.close_requested);
    }

    #[test]
    fn send_to_unknown_user_is_false() {
        let reg = ConnectionRegistry::new(2);
        assert!(!reg.send("ghost", critical()));
    }

    #[test]
    fn conversation_start_event_is_critical() {
        let ev = Outbound::Gateway(ServerEvent::ConversationStart {
            session_id: "s".into(),
            agents: vec![],
        });
        assert!(!ev.droppable());
    }
}

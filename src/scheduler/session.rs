//! Session table: connected agent id -> live outbound channel

use crate::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Producer side of a session's outbound message stream
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Non-owning reference to a session's outbound channel. The transport side
/// keeps one to name the exact session it served.
pub type WeakOutbound = mpsc::WeakUnboundedSender<ServerMessage>;

/// What the broker reports about a connected agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
}

/// One admitted agent. The session is the unique owner of its outbound channel.
#[derive(Debug)]
pub struct AgentSession {
    id: String,
    outbound: Outbound,
    connected_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(id: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            id: id.into(),
            outbound,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// True if this session was admitted with `outbound`
    pub fn is_bound_to(&self, outbound: &Outbound) -> bool {
        self.outbound.same_channel(outbound)
    }

    /// Queue a message for the agent. Fails when the transport side is gone.
    pub fn deliver(&self, message: ServerMessage) -> Result<(), ServerMessage> {
        self.outbound.send(message).map_err(|e| e.0)
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, AgentSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a session; false if the id already has a live session
    pub fn connect(&mut self, agent_id: &str, outbound: Outbound) -> bool {
        if self.sessions.contains_key(agent_id) {
            return false;
        }
        self.sessions
            .insert(agent_id.to_string(), AgentSession::new(agent_id, outbound));
        true
    }

    pub fn disconnect(&mut self, agent_id: &str) -> Option<AgentSession> {
        self.sessions.remove(agent_id)
    }

    /// Remove the session only if it is the one admitted with `outbound`.
    /// A newer session under the same id is left alone.
    pub fn disconnect_bound(&mut self, agent_id: &str, outbound: &Outbound) -> Option<AgentSession> {
        match self.sessions.get(agent_id) {
            Some(session) if session.is_bound_to(outbound) => self.sessions.remove(agent_id),
            _ => None,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentSession> {
        self.sessions.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.sessions.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connected agents ordered by id
    pub fn summaries(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .values()
            .map(|session| SessionInfo {
                agent_id: session.id().to_string(),
                connected_at: session.connected_at(),
            })
            .collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }
}

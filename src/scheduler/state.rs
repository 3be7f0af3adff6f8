//! State owned by the scheduler worker
//!
//! [`BrokerState`] bundles the session table, the service directory and the
//! conversation registry. Every method runs on the worker only, so none of
//! them lock anything. Failures that an agent may see come back as
//! [`OefError`]; the dispatcher decides whether to notify.

use super::session::{AgentSession, Outbound, SessionTable};
use crate::config::NotificationConfig;
use crate::conversation::ConversationRegistry;
use crate::directory::ServiceDirectory;
use crate::error::{OefError, OefResult};
use crate::observability::metrics;
use crate::protocol::{MessageBody, SendMessage, ServerMessage};
use crate::schema::{Instance, QueryModel};
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Point-in-time counts of broker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub sessions: usize,
    pub services: usize,
    pub identities: usize,
    pub conversations: usize,
}

#[derive(Debug, Default)]
pub struct BrokerState {
    sessions: SessionTable,
    directory: ServiceDirectory,
    conversations: ConversationRegistry,
    notifications: NotificationConfig,
}

impl BrokerState {
    pub fn new(notifications: NotificationConfig) -> Self {
        Self {
            notifications,
            ..Self::default()
        }
    }

    pub fn notifications(&self) -> NotificationConfig {
        self.notifications
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn conversations(&self) -> &ConversationRegistry {
        &self.conversations
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.sessions.contains(agent_id)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            sessions: self.sessions.len(),
            services: self.directory.service_count(),
            identities: self.directory.identity_count(),
            conversations: self.conversations.len(),
        }
    }

    /// Admit an agent; false if it already has a live session
    pub fn connect(&mut self, agent_id: &str, outbound: Outbound) -> bool {
        if !self.sessions.connect(agent_id, outbound) {
            warn!(agent_id = %agent_id, "Rejected duplicate session");
            metrics().session_rejected();
            return false;
        }
        info!(agent_id = %agent_id, sessions = self.sessions.len(), "Agent connected");
        metrics().session_admitted();
        true
    }

    /// Remove the session and every directory entry and conversation that
    /// references the agent. Returns false if it was not connected.
    pub fn disconnect(&mut self, agent_id: &str) -> bool {
        let session = self.sessions.disconnect(agent_id);
        self.clean_up(agent_id, session)
    }

    /// Disconnect only the session admitted with `outbound`. A stale request
    /// from a connection the broker already dropped leaves a newer session
    /// under the same id untouched.
    pub fn disconnect_session(&mut self, agent_id: &str, outbound: &Outbound) -> bool {
        let session = self.sessions.disconnect_bound(agent_id, outbound);
        if session.is_none() && self.sessions.contains(agent_id) {
            debug!(agent_id = %agent_id, "Ignoring disconnect for a replaced session");
        }
        self.clean_up(agent_id, session)
    }

    fn clean_up(&mut self, agent_id: &str, session: Option<AgentSession>) -> bool {
        if session.is_none() {
            return false;
        }
        self.directory.remove_agent(agent_id);
        let dropped = self.conversations.remove_agent(agent_id);
        info!(
            agent_id = %agent_id,
            conversations_dropped = dropped,
            sessions = self.sessions.len(),
            "Agent disconnected"
        );
        metrics().session_closed();
        true
    }

    /// Queue a message on the agent's own session. A dead transport
    /// disconnects the agent on the spot.
    pub fn send(&mut self, agent_id: &str, message: ServerMessage) -> bool {
        let Some(session) = self.sessions.get(agent_id) else {
            debug!(agent_id = %agent_id, "Dropping message for agent without session");
            return false;
        };
        if session.deliver(message).is_err() {
            warn!(agent_id = %agent_id, "Outbound channel closed, disconnecting");
            self.disconnect(agent_id);
            return false;
        }
        true
    }

    /// Queue a message for `to` on behalf of `from`. Fails fast when the
    /// destination is not (or no longer) connected.
    pub fn send_to(&mut self, from: &str, to: &str, message: ServerMessage) -> bool {
        if self.send(to, message) {
            metrics().message_routed();
            true
        } else {
            debug!(from = %from, to = %to, "Delivery failed");
            metrics().routing_failed();
            false
        }
    }

    pub fn register_service(&mut self, agent_id: &str, instance: Instance) -> OefResult<()> {
        instance.validate()?;
        self.directory.register(agent_id, instance);
        metrics().registration();
        Ok(())
    }

    pub fn unregister_service(&mut self, agent_id: &str, instance: &Instance) {
        if self.directory.unregister(agent_id, instance) {
            metrics().unregistration();
        }
    }

    pub fn register_description(&mut self, agent_id: &str, instance: Instance) -> OefResult<()> {
        instance.validate()?;
        self.directory.register_identity(agent_id, instance);
        metrics().registration();
        Ok(())
    }

    pub fn unregister_description(&mut self, agent_id: &str) {
        if self.directory.unregister_identity(agent_id) {
            metrics().unregistration();
        }
    }

    pub fn search_agents(&self, query: &QueryModel) -> OefResult<Vec<String>> {
        query.validate()?;
        metrics().search();
        Ok(self.directory.query_identities(query))
    }

    pub fn search_services(&self, query: &QueryModel) -> OefResult<Vec<String>> {
        query.validate()?;
        metrics().search();
        Ok(self.directory.query(query))
    }

    /// Relay a message, advancing the conversation first for negotiation
    /// bodies. Nothing is delivered when either check fails.
    pub fn send_message(&mut self, from: &str, message: SendMessage) -> OefResult<()> {
        let SendMessage {
            conversation_id,
            destination,
            body,
        } = message;

        if !self.sessions.contains(&destination) {
            metrics().routing_failed();
            return Err(OefError::routing(conversation_id, destination));
        }

        if let MessageBody::Fipa(fipa) = &body {
            self.conversations
                .observe(from, &destination, &conversation_id, fipa)
                .map_err(|e| OefError::protocol(e, fipa.msg_id))?;
        }

        let delivery = ServerMessage::delivery(from, conversation_id.as_str(), body);
        if self.send_to(from, &destination, delivery) {
            Ok(())
        } else {
            Err(OefError::routing(conversation_id, destination))
        }
    }

    /// Forget conversations idle for longer than `max_idle`
    pub fn expire_idle(&mut self, max_idle: Duration) -> usize {
        let expired = self.conversations.expire_idle(max_idle).len();
        if expired > 0 {
            info!(expired, "Expired idle conversations");
            metrics().conversations_expired(expired);
        }
        expired
    }
}

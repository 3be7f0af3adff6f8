//! Conversation bookkeeping for FIPA-style negotiations
//!
//! Two views of the same dialogue live here:
//!
//! - [`ConversationRegistry`] is the broker's record of every negotiation it
//!   relays. It enforces the `CFP → PROPOSE → ACCEPT | DECLINE` order and the
//!   `(msg_id, target)` threading, and retires a conversation once it reaches a
//!   terminal state. A retired id stays unknown for the life of the registry.
//! - [`Dialogue`] / [`DialogueBook`] are the agent-side counters an agent uses
//!   to number its own messages and point replies at the right target.
//!
//! Both are plain owned values; nothing is process-global.

use crate::protocol::{FipaKind, FipaMessage};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Which side of a conversation an agent is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Broker-side progress of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cfp,
    Propose,
    Accepted,
    Declined,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Accepted | Stage::Declined)
    }
}

/// Negotiation phase as seen by one party
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    CfpSent,
    CfpReceived,
    ProposeSent,
    ProposeReceived,
    AcceptSent,
    AcceptReceived,
    DeclineSent,
    DeclineReceived,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Unknown or finished conversation '{conversation_id}'")]
    UnknownConversation { conversation_id: String },

    #[error("Conversation '{conversation_id}' already exists")]
    ConversationExists { conversation_id: String },

    #[error("Agent '{agent}' is not a party to conversation '{conversation_id}'")]
    NotAParticipant {
        conversation_id: String,
        agent: String,
    },

    #[error("Unexpected {kind} from {role:?} in conversation '{conversation_id}' at stage {stage:?}")]
    UnexpectedMessage {
        conversation_id: String,
        kind: FipaKind,
        role: Role,
        stage: Stage,
    },

    #[error("Message id {actual} in conversation '{conversation_id}' does not follow {last}")]
    NonMonotonicMsgId {
        conversation_id: String,
        last: u32,
        actual: u32,
    },

    #[error("Target {actual} in conversation '{conversation_id}' does not reference last message {expected}")]
    TargetMismatch {
        conversation_id: String,
        expected: u32,
        actual: u32,
    },
}

impl ProtocolError {
    pub fn conversation_id(&self) -> &str {
        match self {
            ProtocolError::UnknownConversation { conversation_id }
            | ProtocolError::ConversationExists { conversation_id }
            | ProtocolError::NotAParticipant {
                conversation_id, ..
            }
            | ProtocolError::UnexpectedMessage {
                conversation_id, ..
            }
            | ProtocolError::NonMonotonicMsgId {
                conversation_id, ..
            }
            | ProtocolError::TargetMismatch {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// One negotiation tracked by the broker
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    initiator: String,
    responder: String,
    stage: Stage,
    initiator_last: u32,
    responder_last: u32,
    last_sender: Role,
    created_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Conversation {
    fn open(id: &str, initiator: &str, responder: &str, first_msg_id: u32) -> Self {
        Self {
            id: id.to_string(),
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            stage: Stage::Cfp,
            initiator_last: first_msg_id,
            responder_last: 0,
            last_sender: Role::Initiator,
            created_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn responder(&self) -> &str {
        &self.responder
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn role_of(&self, agent: &str) -> Option<Role> {
        if agent == self.initiator {
            Some(Role::Initiator)
        } else if agent == self.responder {
            Some(Role::Responder)
        } else {
            None
        }
    }

    pub fn peer_of(&self, agent: &str) -> Option<&str> {
        match self.role_of(agent)? {
            Role::Initiator => Some(&self.responder),
            Role::Responder => Some(&self.initiator),
        }
    }

    /// Last message id sent by the given side
    pub fn last_msg_id(&self, role: Role) -> u32 {
        match role {
            Role::Initiator => self.initiator_last,
            Role::Responder => self.responder_last,
        }
    }

    /// Phase from the point of view of one party
    pub fn phase(&self, role: Role) -> NegotiationPhase {
        use NegotiationPhase::*;
        let sent_last = self.last_sender == role;
        match (self.stage, role) {
            (Stage::Cfp, Role::Initiator) => CfpSent,
            (Stage::Cfp, Role::Responder) => CfpReceived,
            (Stage::Propose, Role::Initiator) => ProposeReceived,
            (Stage::Propose, Role::Responder) => ProposeSent,
            (Stage::Accepted, Role::Initiator) => AcceptSent,
            (Stage::Accepted, Role::Responder) => AcceptReceived,
            (Stage::Declined, _) if sent_last => DeclineSent,
            (Stage::Declined, _) => DeclineReceived,
        }
    }

    fn next_stage(&self, role: Role, kind: FipaKind) -> Option<Stage> {
        match (self.stage, role, kind) {
            (Stage::Cfp, Role::Responder, FipaKind::Propose) => Some(Stage::Propose),
            (Stage::Cfp, Role::Responder, FipaKind::Decline) => Some(Stage::Declined),
            (Stage::Propose, Role::Initiator, FipaKind::Accept) => Some(Stage::Accepted),
            (Stage::Propose, Role::Initiator, FipaKind::Decline) => Some(Stage::Declined),
            _ => None,
        }
    }
}

/// Broker-owned registry of in-flight negotiations, keyed by conversation id
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: HashMap<String, Conversation>,
    retired: HashSet<String>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a negotiation message from `from` to `to` and advance the
    /// conversation. Returns the conversation state after the message; a
    /// conversation reaching a terminal stage is removed from the registry.
    pub fn observe(
        &mut self,
        from: &str,
        to: &str,
        conversation_id: &str,
        message: &FipaMessage,
    ) -> Result<Conversation, ProtocolError> {
        let kind = message.payload.kind();

        if kind == FipaKind::Cfp {
            return self.open(from, to, conversation_id, message);
        }

        let conversation = self.conversations.get_mut(conversation_id).ok_or_else(|| {
            ProtocolError::UnknownConversation {
                conversation_id: conversation_id.to_string(),
            }
        })?;

        let role = match conversation.role_of(from) {
            Some(role) if conversation.peer_of(from) == Some(to) => role,
            _ => {
                return Err(ProtocolError::NotAParticipant {
                    conversation_id: conversation_id.to_string(),
                    agent: from.to_string(),
                })
            }
        };

        let next = conversation.next_stage(role, kind).ok_or_else(|| {
            ProtocolError::UnexpectedMessage {
                conversation_id: conversation_id.to_string(),
                kind,
                role,
                stage: conversation.stage,
            }
        })?;

        let (own_last, peer_last) = match role {
            Role::Initiator => (conversation.initiator_last, conversation.responder_last),
            Role::Responder => (conversation.responder_last, conversation.initiator_last),
        };
        if message.msg_id <= own_last {
            return Err(ProtocolError::NonMonotonicMsgId {
                conversation_id: conversation_id.to_string(),
                last: own_last,
                actual: message.msg_id,
            });
        }
        if message.target != peer_last {
            return Err(ProtocolError::TargetMismatch {
                conversation_id: conversation_id.to_string(),
                expected: peer_last,
                actual: message.target,
            });
        }

        match role {
            Role::Initiator => conversation.initiator_last = message.msg_id,
            Role::Responder => conversation.responder_last = message.msg_id,
        }
        conversation.stage = next;
        conversation.last_sender = role;
        conversation.last_activity = Instant::now();
        let snapshot = conversation.clone();

        debug!(
            conversation_id = %conversation_id,
            from = %from,
            kind = %kind,
            stage = ?next,
            "Conversation advanced"
        );

        if next.is_terminal() {
            self.retire(conversation_id);
        }
        Ok(snapshot)
    }

    fn open(
        &mut self,
        from: &str,
        to: &str,
        conversation_id: &str,
        message: &FipaMessage,
    ) -> Result<Conversation, ProtocolError> {
        if self.retired.contains(conversation_id) {
            return Err(ProtocolError::UnknownConversation {
                conversation_id: conversation_id.to_string(),
            });
        }
        if self.conversations.contains_key(conversation_id) {
            return Err(ProtocolError::ConversationExists {
                conversation_id: conversation_id.to_string(),
            });
        }
        if message.target != 0 {
            return Err(ProtocolError::TargetMismatch {
                conversation_id: conversation_id.to_string(),
                expected: 0,
                actual: message.target,
            });
        }
        if message.msg_id == 0 {
            return Err(ProtocolError::NonMonotonicMsgId {
                conversation_id: conversation_id.to_string(),
                last: 0,
                actual: 0,
            });
        }

        let conversation = Conversation::open(conversation_id, from, to, message.msg_id);
        debug!(
            conversation_id = %conversation_id,
            initiator = %from,
            responder = %to,
            "Conversation opened"
        );
        self.conversations
            .insert(conversation_id.to_string(), conversation.clone());
        Ok(conversation)
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    /// Drop a conversation and keep its id from ever being opened again
    pub fn retire(&mut self, conversation_id: &str) -> Option<Conversation> {
        self.retired.insert(conversation_id.to_string());
        self.conversations.remove(conversation_id)
    }

    pub fn is_retired(&self, conversation_id: &str) -> bool {
        self.retired.contains(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Drop every conversation the agent takes part in
    pub fn remove_agent(&mut self, agent: &str) -> usize {
        let dropped: Vec<String> = self
            .conversations
            .values()
            .filter(|c| c.initiator == agent || c.responder == agent)
            .map(|c| c.id.clone())
            .collect();
        for id in &dropped {
            self.retire(id);
        }
        dropped.len()
    }

    /// Drop conversations idle for longer than `max_idle`, returning their ids
    pub fn expire_idle(&mut self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .conversations
            .values()
            .filter(|c| now.duration_since(c.last_activity) > max_idle)
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            warn!(conversation_id = %id, "Expiring idle conversation");
            self.retire(id);
        }
        expired
    }
}

// ========== Agent side ==========

/// An agent's own view of one dialogue: who the peer is and how to number
/// the next message.
#[derive(Debug, Clone, PartialEq)]
pub struct Dialogue {
    id: Uuid,
    peer: String,
    last_sent: u32,
    last_received: u32,
}

impl Dialogue {
    /// Start a new dialogue with a fresh v4 id
    pub fn initiate(peer: impl Into<String>) -> Self {
        Self::join(Uuid::new_v4(), peer)
    }

    /// Track a dialogue someone else opened
    pub fn join(id: Uuid, peer: impl Into<String>) -> Self {
        Self {
            id,
            peer: peer.into(),
            last_sent: 0,
            last_received: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conversation_id(&self) -> String {
        self.id.to_string()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Allocate the next outgoing message id (1 for the first message)
    pub fn next_msg_id(&mut self) -> u32 {
        self.last_sent += 1;
        self.last_sent
    }

    pub fn record_received(&mut self, msg_id: u32) {
        self.last_received = msg_id;
    }

    /// Target for a reply: the most recent message received, 0 if none
    pub fn reply_target(&self) -> u32 {
        self.last_received
    }
}

/// Per-agent set of dialogues
#[derive(Debug, Default)]
pub struct DialogueBook {
    dialogues: HashMap<Uuid, Dialogue>,
}

impl DialogueBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiate(&mut self, peer: impl Into<String>) -> &mut Dialogue {
        let dialogue = Dialogue::initiate(peer);
        self.dialogues.entry(dialogue.id).or_insert(dialogue)
    }

    /// Look up a dialogue by its wire id, joining it if it is new
    pub fn join(
        &mut self,
        conversation_id: &str,
        peer: impl Into<String>,
    ) -> Result<&mut Dialogue, uuid::Error> {
        let id = Uuid::parse_str(conversation_id)?;
        Ok(self
            .dialogues
            .entry(id)
            .or_insert_with(|| Dialogue::join(id, peer)))
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Dialogue> {
        self.dialogues.get_mut(&id)
    }

    pub fn finish(&mut self, id: Uuid) -> Option<Dialogue> {
        self.dialogues.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.dialogues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogues.is_empty()
    }
}

//! Wire message types for the OEF agent protocol
//!
//! Three families of messages travel between agents and the broker:
//!
//! - the handshake: [`AgentIdentifier`] → [`ChallengePhrase`] →
//!   [`ChallengeResponse`] → [`ConnectionResult`]
//! - agent → broker: [`Envelope`] wrapping one [`EnvelopePayload`]
//! - broker → agent: [`ServerMessage`] wrapping one [`ServerPayload`]
//!
//! Every alternative is an explicit sum type; callers match on the variant
//! instead of probing optional fields.
//!
//! # Examples
//! ```
//! use oef_core::protocol::{CfpPayload, Envelope, EnvelopePayload, FipaPayload, MessageBody};
//!
//! let envelope = Envelope::cfp("3f0e-conv", "seller", CfpPayload::Nothing, 1, 0);
//! match envelope.payload {
//!     Some(EnvelopePayload::SendMessage(send)) => match send.body {
//!         MessageBody::Fipa(fipa) => {
//!             assert_eq!((fipa.msg_id, fipa.target), (1, 0));
//!             assert!(matches!(fipa.payload, FipaPayload::Cfp(CfpPayload::Nothing)));
//!         }
//!         MessageBody::Content(_) => unreachable!(),
//!     },
//!     _ => unreachable!(),
//! }
//! ```

use crate::schema::{Instance, QueryModel};
use serde::{Deserialize, Serialize};

// ========== Handshake ==========

/// First handshake message: the connecting agent's public key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentIdentifier {
    pub public_key: String,
}

/// Broker challenge, or an immediate refusal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengePhrase {
    Phrase(String),
    Failure,
}

/// Agent's answer to the challenge phrase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeResponse {
    pub answer: String,
}

/// Final handshake message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionResult {
    pub status: bool,
}

// ========== FIPA negotiation ==========

/// Call-for-proposal payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CfpPayload {
    Content(String),
    Query(QueryModel),
    Nothing,
}

/// Proposal payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProposePayload {
    Content(String),
    Proposals(Vec<Instance>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FipaPayload {
    Cfp(CfpPayload),
    Propose(ProposePayload),
    Accept,
    Decline,
}

/// Payload-free discriminant of [`FipaPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FipaKind {
    Cfp,
    Propose,
    Accept,
    Decline,
}

impl FipaPayload {
    pub fn kind(&self) -> FipaKind {
        match self {
            FipaPayload::Cfp(_) => FipaKind::Cfp,
            FipaPayload::Propose(_) => FipaKind::Propose,
            FipaPayload::Accept => FipaKind::Accept,
            FipaPayload::Decline => FipaKind::Decline,
        }
    }
}

impl std::fmt::Display for FipaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FipaKind::Cfp => "cfp",
            FipaKind::Propose => "propose",
            FipaKind::Accept => "accept",
            FipaKind::Decline => "decline",
        };
        f.write_str(name)
    }
}

/// Negotiation message threaded by `(msg_id, target)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FipaMessage {
    /// Sender's own per-conversation counter, 1 for its first message
    pub msg_id: u32,
    /// `msg_id` of the message replied to, 0 for an initiating CFP
    pub target: u32,
    pub payload: FipaPayload,
}

/// Body of a relayed message: free-form content or a negotiation step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    Content(String),
    Fipa(FipaMessage),
}

// ========== Agent -> broker ==========

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessage {
    pub conversation_id: String,
    pub destination: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Search {
    pub search_id: u32,
    pub query: QueryModel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopePayload {
    SendMessage(SendMessage),
    RegisterService { instance: Instance },
    UnregisterService { instance: Instance },
    RegisterDescription { instance: Instance },
    UnregisterDescription,
    SearchAgents(Search),
    SearchServices(Search),
}

/// Top-level agent → broker message
///
/// `payload` is `None` when the sender set no variant; the broker logs and
/// drops such envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub msg_id: u32,
    #[serde(default)]
    pub payload: Option<EnvelopePayload>,
}

impl Envelope {
    pub fn new(payload: EnvelopePayload) -> Self {
        Self {
            msg_id: 0,
            payload: Some(payload),
        }
    }

    pub fn with_msg_id(mut self, msg_id: u32) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn register_service(instance: Instance) -> Self {
        Self::new(EnvelopePayload::RegisterService { instance })
    }

    pub fn unregister_service(instance: Instance) -> Self {
        Self::new(EnvelopePayload::UnregisterService { instance })
    }

    pub fn register_description(instance: Instance) -> Self {
        Self::new(EnvelopePayload::RegisterDescription { instance })
    }

    pub fn unregister_description() -> Self {
        Self::new(EnvelopePayload::UnregisterDescription)
    }

    pub fn search_agents(search_id: u32, query: QueryModel) -> Self {
        Self::new(EnvelopePayload::SearchAgents(Search { search_id, query }))
    }

    pub fn search_services(search_id: u32, query: QueryModel) -> Self {
        Self::new(EnvelopePayload::SearchServices(Search { search_id, query }))
    }

    pub fn message(
        conversation_id: impl Into<String>,
        destination: impl Into<String>,
        body: MessageBody,
    ) -> Self {
        Self::new(EnvelopePayload::SendMessage(SendMessage {
            conversation_id: conversation_id.into(),
            destination: destination.into(),
            body,
        }))
    }

    pub fn content(
        conversation_id: impl Into<String>,
        destination: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::message(
            conversation_id,
            destination,
            MessageBody::Content(content.into()),
        )
    }

    pub fn fipa(
        conversation_id: impl Into<String>,
        destination: impl Into<String>,
        msg_id: u32,
        target: u32,
        payload: FipaPayload,
    ) -> Self {
        Self::message(
            conversation_id,
            destination,
            MessageBody::Fipa(FipaMessage {
                msg_id,
                target,
                payload,
            }),
        )
    }

    pub fn cfp(
        conversation_id: impl Into<String>,
        destination: impl Into<String>,
        payload: CfpPayload,
        msg_id: u32,
        target: u32,
    ) -> Self {
        Self::fipa(
            conversation_id,
            destination,
            msg_id,
            target,
            FipaPayload::Cfp(payload),
        )
    }

    pub fn propose(
        conversation_id: impl Into<String>,
        destination: impl Into<String>,
        payload: ProposePayload,
        msg_id: u32,
        target: u32,
    ) -> Self {
        Self::fipa(
            conversation_id,
            destination,
            msg_id,
            target,
            FipaPayload::Propose(payload),
        )
    }

    pub fn accept(
        conversation_id: impl Into<String>,
        destination: impl Into<String>,
        msg_id: u32,
        target: u32,
    ) -> Self {
        Self::fipa(conversation_id, destination, msg_id, target, FipaPayload::Accept)
    }

    pub fn decline(
        conversation_id: impl Into<String>,
        destination: impl Into<String>,
        msg_id: u32,
        target: u32,
    ) -> Self {
        Self::fipa(conversation_id, destination, msg_id, target, FipaPayload::Decline)
    }

    /// Operation name for logs and error replies
    pub fn operation(&self) -> Option<ErrorOperation> {
        self.payload.as_ref().map(EnvelopePayload::operation)
    }
}

impl EnvelopePayload {
    pub fn operation(&self) -> ErrorOperation {
        match self {
            EnvelopePayload::SendMessage(_) => ErrorOperation::SendMessage,
            EnvelopePayload::RegisterService { .. } => ErrorOperation::RegisterService,
            EnvelopePayload::UnregisterService { .. } => ErrorOperation::UnregisterService,
            EnvelopePayload::RegisterDescription { .. } => ErrorOperation::RegisterDescription,
            EnvelopePayload::UnregisterDescription => ErrorOperation::UnregisterDescription,
            EnvelopePayload::SearchAgents(_) => ErrorOperation::SearchAgents,
            EnvelopePayload::SearchServices(_) => ErrorOperation::SearchServices,
        }
    }
}

// ========== Broker -> agent ==========

/// Operation an [`ErrorReply`] refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorOperation {
    RegisterService,
    UnregisterService,
    RegisterDescription,
    UnregisterDescription,
    SearchAgents,
    SearchServices,
    SendMessage,
}

impl ErrorOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOperation::RegisterService => "REGISTER_SERVICE",
            ErrorOperation::UnregisterService => "UNREGISTER_SERVICE",
            ErrorOperation::RegisterDescription => "REGISTER_DESCRIPTION",
            ErrorOperation::UnregisterDescription => "UNREGISTER_DESCRIPTION",
            ErrorOperation::SearchAgents => "SEARCH_AGENTS",
            ErrorOperation::SearchServices => "SEARCH_SERVICES",
            ErrorOperation::SendMessage => "SEND_MESSAGE",
        }
    }
}

impl std::fmt::Display for ErrorOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReply {
    pub operation: ErrorOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub search_id: u32,
    pub agents: Vec<String>,
}

/// Message delivered on behalf of another agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delivery {
    pub origin: String,
    pub conversation_id: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ServerPayload {
    Error(ErrorReply),
    /// A relayed message could not reach `destination`
    DialogueError {
        conversation_id: String,
        destination: String,
    },
    SearchResult(SearchResult),
    Content(Delivery),
}

/// Top-level broker → agent message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    /// `msg_id` of the envelope this answers, 0 when unsolicited
    #[serde(default)]
    pub answer_id: u32,
    #[serde(default)]
    pub payload: Option<ServerPayload>,
}

impl ServerMessage {
    pub fn new(payload: ServerPayload) -> Self {
        Self {
            answer_id: 0,
            payload: Some(payload),
        }
    }

    pub fn answering(mut self, answer_id: u32) -> Self {
        self.answer_id = answer_id;
        self
    }

    pub fn error(
        operation: ErrorOperation,
        conversation_id: Option<String>,
        msg_id: Option<u32>,
    ) -> Self {
        Self::new(ServerPayload::Error(ErrorReply {
            operation,
            conversation_id,
            msg_id,
        }))
    }

    pub fn dialogue_error(conversation_id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(ServerPayload::DialogueError {
            conversation_id: conversation_id.into(),
            destination: destination.into(),
        })
    }

    pub fn search_result(search_id: u32, agents: Vec<String>) -> Self {
        Self::new(ServerPayload::SearchResult(SearchResult { search_id, agents }))
    }

    pub fn delivery(
        origin: impl Into<String>,
        conversation_id: impl Into<String>,
        body: MessageBody,
    ) -> Self {
        Self::new(ServerPayload::Content(Delivery {
            origin: origin.into(),
            conversation_id: conversation_id.into(),
            body,
        }))
    }
}

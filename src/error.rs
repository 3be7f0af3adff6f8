//! Broker error types
//!
//! Each component defines its own error enum; [`OefError`] aggregates them and
//! knows which failures an agent is allowed to see. Everything else is logged
//! for the operator only.

use crate::conversation::ProtocolError;
use crate::protocol::{CodecError, ErrorOperation, ServerMessage};
use crate::schema::SchemaError;
use thiserror::Error;

/// Main error type for broker operations
#[derive(Debug, Error)]
pub enum OefError {
    #[error("Invalid instance or query: {0}")]
    Schema(#[from] SchemaError),

    #[error("Destination '{destination}' of conversation '{conversation_id}' is not connected")]
    Routing {
        conversation_id: String,
        destination: String,
    },

    #[error("Protocol error on message {msg_id}: {source}")]
    Protocol {
        #[source]
        source: ProtocolError,
        msg_id: u32,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] crate::handshake::HandshakeError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OefError {
    /// Create routing error
    pub fn routing<C: Into<String>, D: Into<String>>(conversation_id: C, destination: D) -> Self {
        Self::Routing {
            conversation_id: conversation_id.into(),
            destination: destination.into(),
        }
    }

    /// Create protocol ordering error for the negotiation message `msg_id`
    pub fn protocol(source: ProtocolError, msg_id: u32) -> Self {
        Self::Protocol { source, msg_id }
    }

    /// Agent-visible reply for a failed `operation`, if the failure has one
    pub fn to_server_message(&self, operation: ErrorOperation) -> Option<ServerMessage> {
        match self {
            OefError::Schema(_) => Some(ServerMessage::error(operation, None, None)),
            OefError::Routing {
                conversation_id,
                destination,
            } => Some(ServerMessage::dialogue_error(
                conversation_id.clone(),
                destination.clone(),
            )),
            OefError::Protocol { source, msg_id } => Some(ServerMessage::error(
                ErrorOperation::SendMessage,
                Some(source.conversation_id().to_string()),
                Some(*msg_id),
            )),
            OefError::Codec(_)
            | OefError::Handshake(_)
            | OefError::Scheduler(_)
            | OefError::Config(_)
            | OefError::Io(_) => None,
        }
    }

    pub fn is_routing(&self) -> bool {
        matches!(self, OefError::Routing { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, OefError::Protocol { .. })
    }
}

/// Result type for broker operations
pub type OefResult<T> = Result<T, OefError>;

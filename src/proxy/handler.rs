//! Agent callbacks and the decoder that drives them

use super::OefCore;
use crate::protocol::{
    CfpPayload, ErrorOperation, FipaPayload, MessageBody, ProposePayload, ServerMessage,
    ServerPayload,
};
use async_trait::async_trait;
use tracing::{trace, warn};

/// Callbacks for everything the broker can deliver to an agent.
///
/// `core` is the connection the message arrived on, so a handler can answer
/// from inside a callback. Every method has a default that only logs.
#[async_trait]
pub trait AgentHandler: Send {
    async fn on_error(
        &mut self,
        _core: &dyn OefCore,
        answer_id: u32,
        operation: ErrorOperation,
        conversation_id: Option<String>,
        msg_id: Option<u32>,
    ) {
        warn!(
            answer_id,
            operation = %operation,
            conversation_id = ?conversation_id,
            msg_id = ?msg_id,
            "Broker reported an error"
        );
    }

    async fn on_dialogue_error(
        &mut self,
        _core: &dyn OefCore,
        answer_id: u32,
        conversation_id: String,
        destination: String,
    ) {
        warn!(answer_id, conversation_id = %conversation_id, destination = %destination, "Dialogue error");
    }

    async fn on_search_result(&mut self, _core: &dyn OefCore, search_id: u32, agents: Vec<String>) {
        trace!(search_id, found = agents.len(), "Unhandled search result");
    }

    async fn on_message(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        _content: String,
    ) {
        trace!(origin = %origin, conversation_id = %conversation_id, "Unhandled message");
    }

    async fn on_cfp(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
        _payload: CfpPayload,
    ) {
        trace!(origin = %origin, conversation_id = %conversation_id, msg_id, target, "Unhandled CFP");
    }

    async fn on_propose(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
        _payload: ProposePayload,
    ) {
        trace!(origin = %origin, conversation_id = %conversation_id, msg_id, target, "Unhandled propose");
    }

    async fn on_accept(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    ) {
        trace!(origin = %origin, conversation_id = %conversation_id, msg_id, target, "Unhandled accept");
    }

    async fn on_decline(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    ) {
        trace!(origin = %origin, conversation_id = %conversation_id, msg_id, target, "Unhandled decline");
    }
}

/// Turns a [`ServerMessage`] into exactly one [`AgentHandler`] call
pub struct MessageDecoder;

impl MessageDecoder {
    pub async fn decode(core: &dyn OefCore, handler: &mut dyn AgentHandler, message: ServerMessage) {
        let answer_id = message.answer_id;
        let Some(payload) = message.payload else {
            warn!(agent_id = %core.public_key(), answer_id, "Server message without payload, dropping");
            return;
        };

        match payload {
            ServerPayload::Error(error) => {
                handler
                    .on_error(core, answer_id, error.operation, error.conversation_id, error.msg_id)
                    .await
            }
            ServerPayload::DialogueError {
                conversation_id,
                destination,
            } => {
                handler
                    .on_dialogue_error(core, answer_id, conversation_id, destination)
                    .await
            }
            ServerPayload::SearchResult(result) => {
                handler
                    .on_search_result(core, result.search_id, result.agents)
                    .await
            }
            ServerPayload::Content(delivery) => {
                let origin = delivery.origin;
                let conversation_id = delivery.conversation_id;
                match delivery.body {
                    MessageBody::Content(content) => {
                        handler.on_message(core, origin, conversation_id, content).await
                    }
                    MessageBody::Fipa(fipa) => {
                        trace!(
                            origin = %origin,
                            conversation_id = %conversation_id,
                            kind = %fipa.payload.kind(),
                            msg_id = fipa.msg_id,
                            target = fipa.target,
                            "Dispatching negotiation message"
                        );
                        let (msg_id, target) = (fipa.msg_id, fipa.target);
                        match fipa.payload {
                            FipaPayload::Cfp(payload) => {
                                handler
                                    .on_cfp(core, origin, conversation_id, msg_id, target, payload)
                                    .await
                            }
                            FipaPayload::Propose(payload) => {
                                handler
                                    .on_propose(core, origin, conversation_id, msg_id, target, payload)
                                    .await
                            }
                            FipaPayload::Accept => {
                                handler
                                    .on_accept(core, origin, conversation_id, msg_id, target)
                                    .await
                            }
                            FipaPayload::Decline => {
                                handler
                                    .on_decline(core, origin, conversation_id, msg_id, target)
                                    .await
                            }
                        }
                    }
                }
            }
        }
    }
}

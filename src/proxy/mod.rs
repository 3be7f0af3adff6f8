//! Agent-side access to the broker
//!
//! [`OefCore`] is the single capability an agent programs against. Two
//! implementations exist: [`NetworkProxy`] speaks the framed wire protocol to
//! a remote broker, [`LocalProxy`] talks to an in-process scheduler. Incoming
//! messages reach the agent through an [`AgentHandler`].

pub mod handler;
pub mod local;
pub mod network;

pub use handler::{AgentHandler, MessageDecoder};
pub use local::LocalProxy;
pub use network::NetworkProxy;

use crate::error::OefResult;
use crate::protocol::{CfpPayload, Envelope, ProposePayload};
use crate::schema::{Instance, QueryModel};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

#[async_trait]
pub trait OefCore: Send + Sync {
    /// Identity this connection was admitted under
    fn public_key(&self) -> &str;

    /// Get admitted by the broker. Must complete before anything else.
    async fn handshake(&self) -> OefResult<()>;

    /// Deliver incoming messages to `handler` until the session ends
    async fn run(&self, handler: &mut dyn AgentHandler) -> OefResult<()>;

    /// Send one envelope. A zero `msg_id` is replaced with the next
    /// per-connection id; replies carry it back as `answer_id`.
    async fn send_envelope(&self, envelope: Envelope) -> OefResult<()>;

    /// Leave the broker; `run` returns once the session is closed
    async fn stop(&self) -> OefResult<()>;

    async fn register_description(&self, instance: Instance) -> OefResult<()> {
        self.send_envelope(Envelope::register_description(instance))
            .await
    }

    async fn unregister_description(&self) -> OefResult<()> {
        self.send_envelope(Envelope::unregister_description()).await
    }

    async fn register_service(&self, instance: Instance) -> OefResult<()> {
        self.send_envelope(Envelope::register_service(instance)).await
    }

    async fn unregister_service(&self, instance: Instance) -> OefResult<()> {
        self.send_envelope(Envelope::unregister_service(instance))
            .await
    }

    async fn search_agents(&self, search_id: u32, query: QueryModel) -> OefResult<()> {
        self.send_envelope(Envelope::search_agents(search_id, query))
            .await
    }

    async fn search_services(&self, search_id: u32, query: QueryModel) -> OefResult<()> {
        self.send_envelope(Envelope::search_services(search_id, query))
            .await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        destination: &str,
        content: &str,
    ) -> OefResult<()> {
        self.send_envelope(Envelope::content(conversation_id, destination, content))
            .await
    }

    async fn send_cfp(
        &self,
        conversation_id: &str,
        destination: &str,
        payload: CfpPayload,
        msg_id: u32,
        target: u32,
    ) -> OefResult<()> {
        self.send_envelope(Envelope::cfp(conversation_id, destination, payload, msg_id, target))
            .await
    }

    async fn send_propose(
        &self,
        conversation_id: &str,
        destination: &str,
        payload: ProposePayload,
        msg_id: u32,
        target: u32,
    ) -> OefResult<()> {
        self.send_envelope(Envelope::propose(
            conversation_id,
            destination,
            payload,
            msg_id,
            target,
        ))
        .await
    }

    async fn send_accept(
        &self,
        conversation_id: &str,
        destination: &str,
        msg_id: u32,
        target: u32,
    ) -> OefResult<()> {
        self.send_envelope(Envelope::accept(conversation_id, destination, msg_id, target))
            .await
    }

    async fn send_decline(
        &self,
        conversation_id: &str,
        destination: &str,
        msg_id: u32,
        target: u32,
    ) -> OefResult<()> {
        self.send_envelope(Envelope::decline(conversation_id, destination, msg_id, target))
            .await
    }
}

/// Per-connection envelope numbering, starting at 1
#[derive(Debug, Default)]
pub(crate) struct EnvelopeIds(AtomicU32);

impl EnvelopeIds {
    pub(crate) fn stamp(&self, envelope: Envelope) -> Envelope {
        if envelope.msg_id != 0 {
            return envelope;
        }
        let id = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        envelope.with_msg_id(id)
    }
}

//! In-process [`OefCore`] backed directly by a scheduler handle

use super::{AgentHandler, EnvelopeIds, MessageDecoder, OefCore};
use crate::config::validate_agent_id;
use crate::error::OefResult;
use crate::handshake::HandshakeError;
use crate::protocol::{Envelope, ServerMessage};
use crate::scheduler::SchedulerHandle;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub struct LocalProxy {
    public_key: String,
    scheduler: SchedulerHandle,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    ids: EnvelopeIds,
}

impl LocalProxy {
    pub fn new(public_key: impl Into<String>, scheduler: SchedulerHandle) -> Self {
        Self {
            public_key: public_key.into(),
            scheduler,
            inbox: Mutex::new(None),
            ids: EnvelopeIds::default(),
        }
    }
}

#[async_trait]
impl OefCore for LocalProxy {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    async fn handshake(&self) -> OefResult<()> {
        validate_agent_id(&self.public_key)?;

        let (outbound, inbox) = mpsc::unbounded_channel();
        if !self.scheduler.connect(self.public_key.as_str(), outbound).await? {
            return Err(HandshakeError::AlreadyConnected(self.public_key.clone()).into());
        }
        *self.inbox.lock().await = Some(inbox);
        info!(agent_id = %self.public_key, "Connected to local scheduler");
        Ok(())
    }

    async fn run(&self, handler: &mut dyn AgentHandler) -> OefResult<()> {
        let Some(mut inbox) = self.inbox.lock().await.take() else {
            return Err(HandshakeError::Refused.into());
        };
        while let Some(message) = inbox.recv().await {
            MessageDecoder::decode(self, handler, message).await;
        }
        debug!(agent_id = %self.public_key, "Local session ended");
        Ok(())
    }

    async fn send_envelope(&self, envelope: Envelope) -> OefResult<()> {
        let envelope = self.ids.stamp(envelope);
        Ok(self.scheduler.submit(self.public_key.as_str(), envelope)?)
    }

    async fn stop(&self) -> OefResult<()> {
        Ok(self.scheduler.disconnect(self.public_key.as_str())?)
    }
}

//! [`OefCore`] over TCP to a remote broker

use super::{AgentHandler, EnvelopeIds, MessageDecoder, OefCore};
use crate::config::ClientConfig;
use crate::dispatch_span;
use crate::error::OefResult;
use crate::handshake;
use crate::protocol::codec::{read_frame, send_message};
use crate::protocol::{codec, CodecError, Envelope, ServerMessage, DEFAULT_MAX_FRAME_BYTES};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

pub struct NetworkProxy {
    config: ClientConfig,
    max_frame: usize,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    ids: EnvelopeIds,
}

impl NetworkProxy {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            max_frame: DEFAULT_MAX_FRAME_BYTES,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            ids: EnvelopeIds::default(),
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

#[async_trait]
impl OefCore for NetworkProxy {
    fn public_key(&self) -> &str {
        &self.config.public_key
    }

    async fn handshake(&self) -> OefResult<()> {
        self.config.validate()?;
        let address = self.config.broker_address()?;

        let mut stream = TcpStream::connect(address.as_str()).await?;
        stream.set_nodelay(true)?;
        handshake::perform(
            &mut stream,
            &self.config.public_key,
            self.max_frame,
            self.config.handshake_timeout(),
        )
        .await?;

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        info!(agent_id = %self.config.public_key, broker = %address, "Connected to broker");
        Ok(())
    }

    async fn run(&self, handler: &mut dyn AgentHandler) -> OefResult<()> {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return Err(CodecError::ConnectionClosed.into());
        };

        loop {
            let frame = match read_frame(&mut reader, self.max_frame).await {
                Ok(frame) => frame,
                Err(CodecError::ConnectionClosed) => {
                    debug!(agent_id = %self.config.public_key, "Broker closed the session");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let message: ServerMessage = match codec::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable server message");
                    continue;
                }
            };

            let span = dispatch_span!(self.config.public_key, answer_id = message.answer_id);
            MessageDecoder::decode(self, handler, message)
                .instrument(span)
                .await;
        }
    }

    async fn send_envelope(&self, envelope: Envelope) -> OefResult<()> {
        let envelope = self.ids.stamp(envelope);
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(CodecError::ConnectionClosed.into());
        };
        send_message(writer, &envelope, self.max_frame).await?;
        Ok(())
    }

    async fn stop(&self) -> OefResult<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
            info!(agent_id = %self.config.public_key, "Disconnected from broker");
        }
        Ok(())
    }
}

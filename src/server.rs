//! TCP front end of the broker
//!
//! Each accepted connection runs the handshake, then splits into a reader
//! that submits decoded envelopes to the scheduler and a writer that drains
//! the session's outbound channel. Either side ending ends the session.

use crate::config::BrokerConfig;
use crate::dispatch::decode_envelope;
use crate::error::OefResult;
use crate::handshake;
use crate::observability::metrics;
use crate::protocol::codec::{read_frame, send_message};
use crate::protocol::{CodecError, ServerMessage};
use crate::scheduler::{Scheduler, SchedulerHandle, WeakOutbound};
use crate::session_span;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// A bound broker: listener plus its scheduler
pub struct Broker {
    listener: TcpListener,
    scheduler: Scheduler,
    max_frame: usize,
    handshake_timeout: Duration,
}

impl Broker {
    /// Bind the listener and start the scheduler worker
    pub async fn bind(config: &BrokerConfig) -> OefResult<Self> {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Broker listening");

        Ok(Self {
            listener,
            scheduler: Scheduler::spawn(config),
            max_frame: config.broker.max_frame_bytes,
            handshake_timeout: config.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> OefResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Accept connections until `shutdown` resolves, then stop the scheduler.
    /// Stopping the scheduler closes every session's outbound channel, which
    /// ends the connection tasks.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            scheduler: self.scheduler.handle(),
                            max_frame: self.max_frame,
                            handshake_timeout: self.handshake_timeout,
                        };
                        tokio::spawn(connection.serve(stream, peer));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        self.scheduler.shutdown().await;
        info!("Broker stopped");
    }
}

struct Connection {
    scheduler: SchedulerHandle,
    max_frame: usize,
    handshake_timeout: Duration,
}

impl Connection {
    async fn serve(self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = outbound.downgrade();
        let agent_id = match handshake::accept(
            &mut stream,
            &self.scheduler,
            outbound,
            self.max_frame,
            self.handshake_timeout,
        )
        .await
        {
            Ok(agent_id) => agent_id,
            Err(e) => {
                info!(peer = %peer, error = %e, "Connection not admitted");
                return;
            }
        };

        let span = session_span!(agent_id, peer = %peer);
        self.run_session(stream, agent_id, session, outbound_rx)
            .instrument(span)
            .await;
    }

    async fn run_session(
        self,
        stream: TcpStream,
        agent_id: String,
        session: WeakOutbound,
        outbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let (reader, writer) = stream.into_split();
        let mut writer_task = tokio::spawn(
            write_loop(writer, outbound_rx, self.max_frame).in_current_span(),
        );

        tokio::select! {
            _ = self.read_loop(reader, &agent_id) => {}
            _ = &mut writer_task => {
                debug!("Outbound stream ended");
            }
        }
        writer_task.abort();

        // The broker may have dropped this session already and admitted a new
        // one under the same id; only ours is removed
        if self
            .scheduler
            .disconnect_session(agent_id.as_str(), session)
            .is_err()
        {
            debug!("Scheduler stopped before disconnect");
        }
        info!("Session closed");
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, agent_id: &str) {
        loop {
            let frame = match read_frame(&mut reader, self.max_frame).await {
                Ok(frame) => frame,
                Err(CodecError::ConnectionClosed) => {
                    debug!("Peer closed connection");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Transport error, closing session");
                    return;
                }
            };

            let envelope = match decode_envelope(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, bytes = frame.len(), "Dropping undecodable envelope");
                    metrics().decode_error();
                    continue;
                }
            };

            if self.scheduler.submit(agent_id, envelope).is_err() {
                debug!("Scheduler stopped, closing session");
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    max_frame: usize,
) {
    while let Some(message) = outbound_rx.recv().await {
        if let Err(e) = send_message(&mut writer, &message, max_frame).await {
            error!(error = %e, "Failed to write to agent");
            return;
        }
    }
}

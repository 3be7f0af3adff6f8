//! Scheduler: one worker task owning all broker state
//!
//! Every session, directory and conversation mutation is a [`Command`] on a
//! single unbounded queue. Exactly one task drains it, so commands are
//! processed one at a time in enqueue order across all agents. A
//! [`Command::Stop`] sentinel ends the worker; anything queued behind it is
//! dropped unprocessed.
//!
//! The single consumer is the throughput ceiling of the broker. Sharding the
//! queue is possible as long as one agent's stream is never split.

pub mod session;
pub mod state;

pub use session::{AgentSession, Outbound, SessionInfo, SessionTable, WeakOutbound};
pub use state::{BrokerState, BrokerStats};

use crate::config::BrokerConfig;
use crate::dispatch;
use crate::error::OefResult;
use crate::protocol::{Envelope, ServerMessage};
use crate::schema::QueryModel;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error("Scheduler has stopped")]
    Stopped,
}

/// Work item for the scheduler worker
#[derive(Debug)]
pub enum Command {
    Connect {
        agent_id: String,
        outbound: Outbound,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        agent_id: String,
        /// Set by the transport: only this session may be removed
        session: Option<WeakOutbound>,
    },
    Envelope {
        agent_id: String,
        envelope: Envelope,
    },
    Send {
        agent_id: String,
        message: ServerMessage,
    },
    SendTo {
        from: String,
        to: String,
        message: ServerMessage,
        reply: oneshot::Sender<bool>,
    },
    SearchAgents {
        query: QueryModel,
        reply: oneshot::Sender<OefResult<Vec<String>>>,
    },
    SearchServices {
        query: QueryModel,
        reply: oneshot::Sender<OefResult<Vec<String>>>,
    },
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    ExpireIdle {
        max_idle: Duration,
    },
    Stop,
}

/// Cloneable producer side of the scheduler queue
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    fn enqueue(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx.send(command).map_err(|_| SchedulerError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.enqueue(build(reply))?;
        // A dropped reply means the worker stopped before reaching the command
        response.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Admit a session. `Ok(false)` if the id already has one.
    pub async fn connect(
        &self,
        agent_id: impl Into<String>,
        outbound: Outbound,
    ) -> Result<bool, SchedulerError> {
        let agent_id = agent_id.into();
        self.request(|reply| Command::Connect {
            agent_id,
            outbound,
            reply,
        })
        .await
    }

    pub fn disconnect(&self, agent_id: impl Into<String>) -> Result<(), SchedulerError> {
        self.enqueue(Command::Disconnect {
            agent_id: agent_id.into(),
            session: None,
        })
    }

    /// Disconnect the session admitted with the channel `session` refers to.
    /// No-op if that session is already gone, even when the id reconnected.
    pub fn disconnect_session(
        &self,
        agent_id: impl Into<String>,
        session: WeakOutbound,
    ) -> Result<(), SchedulerError> {
        self.enqueue(Command::Disconnect {
            agent_id: agent_id.into(),
            session: Some(session),
        })
    }

    /// Queue an envelope received from a connected agent
    pub fn submit(
        &self,
        agent_id: impl Into<String>,
        envelope: Envelope,
    ) -> Result<(), SchedulerError> {
        self.enqueue(Command::Envelope {
            agent_id: agent_id.into(),
            envelope,
        })
    }

    /// Queue a message for the agent's own session
    pub fn send(
        &self,
        agent_id: impl Into<String>,
        message: ServerMessage,
    ) -> Result<(), SchedulerError> {
        self.enqueue(Command::Send {
            agent_id: agent_id.into(),
            message,
        })
    }

    /// Queue a message for another agent. `Ok(false)` if it was not delivered.
    pub async fn send_to(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        message: ServerMessage,
    ) -> Result<bool, SchedulerError> {
        let (from, to) = (from.into(), to.into());
        self.request(|reply| Command::SendTo {
            from,
            to,
            message,
            reply,
        })
        .await
    }

    /// Agents whose identity matches. An invalid query is an error, not an
    /// empty result.
    pub async fn search_agents(&self, query: QueryModel) -> OefResult<Vec<String>> {
        self.request(|reply| Command::SearchAgents { query, reply })
            .await?
    }

    /// Agents offering a matching service
    pub async fn search_services(&self, query: QueryModel) -> OefResult<Vec<String>> {
        self.request(|reply| Command::SearchServices { query, reply })
            .await?
    }

    /// Counts as of every command queued before this call
    pub async fn stats(&self) -> Result<BrokerStats, SchedulerError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Connected agents ordered by id
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, SchedulerError> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    pub fn expire_idle(&self, max_idle: Duration) -> Result<(), SchedulerError> {
        self.enqueue(Command::ExpireIdle { max_idle })
    }

    /// Queue the stop sentinel
    pub fn stop(&self) -> Result<(), SchedulerError> {
        self.enqueue(Command::Stop)
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns and owns the worker task
pub struct Scheduler {
    handle: SchedulerHandle,
    worker: JoinHandle<()>,
}

impl Scheduler {
    /// Start the worker with the notification and expiry settings of `config`
    pub fn spawn(config: &BrokerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle { tx };
        let state = BrokerState::new(config.notifications);
        let worker = tokio::spawn(run_worker(rx, state));

        if let Some(max_idle) = config.conversations.idle_timeout() {
            tokio::spawn(run_sweeper(
                handle.clone(),
                max_idle,
                config.conversations.sweep_interval(),
            ));
        }

        Self { handle, worker }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Send the stop sentinel and wait for the worker to finish
    pub async fn shutdown(self) {
        if self.handle.stop().is_err() {
            debug!("Scheduler already stopped");
        }
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Scheduler worker ended abnormally");
        }
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Command>, mut state: BrokerState) {
    info!("Scheduler worker started");

    while let Some(command) = rx.recv().await {
        if let Command::Stop = command {
            break;
        }
        apply(&mut state, command);
    }

    rx.close();
    let pending = std::iter::from_fn(|| rx.try_recv().ok()).count();
    info!(
        pending_dropped = pending,
        sessions = state.sessions().len(),
        "Scheduler worker stopped"
    );
}

fn apply(state: &mut BrokerState, command: Command) {
    match command {
        Command::Connect {
            agent_id,
            outbound,
            reply,
        } => {
            let admitted = state.connect(&agent_id, outbound);
            if reply.send(admitted).is_err() && admitted {
                // Connecting side gave up while queued
                state.disconnect(&agent_id);
            }
        }
        Command::Disconnect {
            agent_id,
            session: None,
        } => {
            state.disconnect(&agent_id);
        }
        Command::Disconnect {
            agent_id,
            session: Some(session),
        } => match session.upgrade() {
            Some(outbound) => {
                state.disconnect_session(&agent_id, &outbound);
            }
            // Every sender is gone, so the broker already dropped that session
            None => debug!(agent_id = %agent_id, "Session already closed"),
        },
        Command::Envelope { agent_id, envelope } => {
            if state.is_connected(&agent_id) {
                if let Err(e) = dispatch::dispatch(state, &agent_id, envelope) {
                    debug!(agent_id = %agent_id, error = %e, "Envelope not applied");
                }
            } else {
                debug!(agent_id = %agent_id, "Dropping envelope from disconnected agent");
            }
        }
        Command::Send { agent_id, message } => {
            state.send(&agent_id, message);
        }
        Command::SendTo {
            from,
            to,
            message,
            reply,
        } => {
            let _ = reply.send(state.send_to(&from, &to, message));
        }
        Command::SearchAgents { query, reply } => {
            let _ = reply.send(state.search_agents(&query));
        }
        Command::SearchServices { query, reply } => {
            let _ = reply.send(state.search_services(&query));
        }
        Command::Stats { reply } => {
            let _ = reply.send(state.stats());
        }
        Command::Sessions { reply } => {
            let _ = reply.send(state.sessions().summaries());
        }
        Command::ExpireIdle { max_idle } => {
            state.expire_idle(max_idle);
        }
        Command::Stop => {}
    }
}

async fn run_sweeper(handle: SchedulerHandle, max_idle: Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        if handle.expire_idle(max_idle).is_err() {
            break;
        }
    }
}

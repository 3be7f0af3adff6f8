//! Handler implementations for tests
//!
//! [`RecordingHandler`] keeps every callback it receives so tests can assert on
//! what an agent saw. [`ScriptedSeller`] answers every CFP with a fixed set of
//! offers, which is enough to drive a full negotiation.

use crate::conversation::DialogueBook;
use crate::protocol::{CfpPayload, ErrorOperation, ProposePayload};
use crate::proxy::{AgentHandler, OefCore};
use crate::schema::Instance;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// One [`AgentHandler`] callback, with its arguments
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Error {
        answer_id: u32,
        operation: ErrorOperation,
        conversation_id: Option<String>,
        msg_id: Option<u32>,
    },
    DialogueError {
        answer_id: u32,
        conversation_id: String,
        destination: String,
    },
    SearchResult {
        search_id: u32,
        agents: Vec<String>,
    },
    Message {
        origin: String,
        conversation_id: String,
        content: String,
    },
    Cfp {
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
        payload: CfpPayload,
    },
    Propose {
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
        payload: ProposePayload,
    },
    Accept {
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    },
    Decline {
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    },
}

/// Handler that records everything it is given.
///
/// Clones share the same event log, so a test can keep one clone and move the
/// other into the agent's run loop.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<HandlerEvent>>>,
    notify: Arc<Notify>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, event: HandlerEvent) {
        self.events.lock().await.push(event);
        self.notify.notify_waiters();
    }

    pub async fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }

    /// Wait until at least `count` events arrived or `timeout` passed, then
    /// return whatever has been recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<HandlerEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let events = self.events.lock().await;
                if events.len() >= count {
                    return events.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.events().await;
            }
        }
    }

    /// Agent ids of the first search result answering `search_id`
    pub async fn search_result(&self, search_id: u32) -> Option<Vec<String>> {
        self.events.lock().await.iter().find_map(|event| match event {
            HandlerEvent::SearchResult {
                search_id: id,
                agents,
            } if *id == search_id => Some(agents.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl AgentHandler for RecordingHandler {
    async fn on_error(
        &mut self,
        _core: &dyn OefCore,
        answer_id: u32,
        operation: ErrorOperation,
        conversation_id: Option<String>,
        msg_id: Option<u32>,
    ) {
        self.record(HandlerEvent::Error {
            answer_id,
            operation,
            conversation_id,
            msg_id,
        })
        .await;
    }

    async fn on_dialogue_error(
        &mut self,
        _core: &dyn OefCore,
        answer_id: u32,
        conversation_id: String,
        destination: String,
    ) {
        self.record(HandlerEvent::DialogueError {
            answer_id,
            conversation_id,
            destination,
        })
        .await;
    }

    async fn on_search_result(&mut self, _core: &dyn OefCore, search_id: u32, agents: Vec<String>) {
        self.record(HandlerEvent::SearchResult { search_id, agents })
            .await;
    }

    async fn on_message(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        content: String,
    ) {
        self.record(HandlerEvent::Message {
            origin,
            conversation_id,
            content,
        })
        .await;
    }

    async fn on_cfp(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
        payload: CfpPayload,
    ) {
        self.record(HandlerEvent::Cfp {
            origin,
            conversation_id,
            msg_id,
            target,
            payload,
        })
        .await;
    }

    async fn on_propose(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
        payload: ProposePayload,
    ) {
        self.record(HandlerEvent::Propose {
            origin,
            conversation_id,
            msg_id,
            target,
            payload,
        })
        .await;
    }

    async fn on_accept(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    ) {
        self.record(HandlerEvent::Accept {
            origin,
            conversation_id,
            msg_id,
            target,
        })
        .await;
    }

    async fn on_decline(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    ) {
        self.record(HandlerEvent::Decline {
            origin,
            conversation_id,
            msg_id,
            target,
        })
        .await;
    }
}

/// Responder that proposes `offers` to every CFP it receives and records
/// all callbacks in `recorder`.
pub struct ScriptedSeller {
    offers: Vec<Instance>,
    dialogues: DialogueBook,
    recorder: RecordingHandler,
}

impl ScriptedSeller {
    pub fn new(offers: Vec<Instance>, recorder: RecordingHandler) -> Self {
        Self {
            offers,
            dialogues: DialogueBook::new(),
            recorder,
        }
    }

    /// Dialogues still waiting for an accept or decline
    pub fn open_dialogues(&self) -> usize {
        self.dialogues.len()
    }

    fn finish(&mut self, conversation_id: &str) {
        if let Ok(id) = uuid::Uuid::parse_str(conversation_id) {
            self.dialogues.finish(id);
        }
    }
}

#[async_trait]
impl AgentHandler for ScriptedSeller {
    async fn on_cfp(
        &mut self,
        core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
        payload: CfpPayload,
    ) {
        self.recorder
            .record(HandlerEvent::Cfp {
                origin: origin.clone(),
                conversation_id: conversation_id.clone(),
                msg_id,
                target,
                payload,
            })
            .await;

        let (reply_id, reply_target) = match self.dialogues.join(&conversation_id, origin.as_str()) {
            Ok(dialogue) => {
                dialogue.record_received(msg_id);
                (dialogue.next_msg_id(), dialogue.reply_target())
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "CFP with a non-UUID conversation id");
                return;
            }
        };

        let proposal = ProposePayload::Proposals(self.offers.clone());
        if let Err(e) = core
            .send_propose(&conversation_id, &origin, proposal, reply_id, reply_target)
            .await
        {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to send proposal");
        }
    }

    async fn on_accept(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    ) {
        self.finish(&conversation_id);
        self.recorder
            .record(HandlerEvent::Accept {
                origin,
                conversation_id,
                msg_id,
                target,
            })
            .await;
    }

    async fn on_decline(
        &mut self,
        _core: &dyn OefCore,
        origin: String,
        conversation_id: String,
        msg_id: u32,
        target: u32,
    ) {
        self.finish(&conversation_id);
        self.recorder
            .record(HandlerEvent::Decline {
                origin,
                conversation_id,
                msg_id,
                target,
            })
            .await;
    }

    async fn on_error(
        &mut self,
        core: &dyn OefCore,
        answer_id: u32,
        operation: ErrorOperation,
        conversation_id: Option<String>,
        msg_id: Option<u32>,
    ) {
        self.recorder
            .on_error(core, answer_id, operation, conversation_id, msg_id)
            .await;
    }
}

//! Envelope dispatch
//!
//! Decodes the one variant an [`Envelope`] carries and runs the matching
//! broker operation on the worker's [`BrokerState`]. Agent-visible failures
//! are turned into replies according to the notification settings; the rest
//! is logged. An envelope with no variant set is logged and dropped.

use crate::dispatch_span;
use crate::error::{OefError, OefResult};
use crate::observability::metrics;
use crate::protocol::{codec, CodecError, Envelope, EnvelopePayload, ErrorOperation, ServerMessage};
use crate::scheduler::BrokerState;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Decode a frame body into an envelope
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, CodecError> {
    codec::decode(frame)
}

/// Run one envelope from `agent_id`. Returns the operation's outcome after
/// any reply has been queued.
pub fn dispatch(state: &mut BrokerState, agent_id: &str, envelope: Envelope) -> OefResult<()> {
    let Envelope { msg_id, payload } = envelope;
    let Some(payload) = payload else {
        warn!(agent_id = %agent_id, msg_id, "Envelope without payload, dropping");
        metrics().decode_error();
        return Ok(());
    };

    let operation = payload.operation();
    let span = dispatch_span!(agent_id, operation = operation.as_str(), msg_id);
    let _guard = span.enter();
    let started = Instant::now();

    let result = run(state, agent_id, msg_id, payload);

    metrics().envelope_processed(operation.as_str(), started.elapsed(), result.is_ok());
    if let Err(e) = &result {
        report(state, agent_id, msg_id, operation, e);
    }
    result
}

fn run(
    state: &mut BrokerState,
    agent_id: &str,
    msg_id: u32,
    payload: EnvelopePayload,
) -> OefResult<()> {
    match payload {
        EnvelopePayload::RegisterService { instance } => state.register_service(agent_id, instance),
        EnvelopePayload::UnregisterService { instance } => {
            state.unregister_service(agent_id, &instance);
            Ok(())
        }
        EnvelopePayload::RegisterDescription { instance } => {
            state.register_description(agent_id, instance)
        }
        EnvelopePayload::UnregisterDescription => {
            state.unregister_description(agent_id);
            Ok(())
        }
        EnvelopePayload::SearchAgents(search) => {
            let agents = state.search_agents(&search.query)?;
            debug!(search_id = search.search_id, found = agents.len(), "Agent search");
            state.send(
                agent_id,
                ServerMessage::search_result(search.search_id, agents).answering(msg_id),
            );
            Ok(())
        }
        EnvelopePayload::SearchServices(search) => {
            let agents = state.search_services(&search.query)?;
            debug!(search_id = search.search_id, found = agents.len(), "Service search");
            state.send(
                agent_id,
                ServerMessage::search_result(search.search_id, agents).answering(msg_id),
            );
            Ok(())
        }
        EnvelopePayload::SendMessage(message) => state.send_message(agent_id, message),
    }
}

/// Log a failed operation and, when allowed, tell the sender
fn report(
    state: &mut BrokerState,
    agent_id: &str,
    msg_id: u32,
    operation: ErrorOperation,
    error: &OefError,
) {
    let notifications = state.notifications();
    let notify = match error {
        OefError::Routing { .. } => {
            warn!(agent_id = %agent_id, error = %error, "Routing failed");
            notifications.routing_errors
        }
        OefError::Protocol { .. } => {
            error!(agent_id = %agent_id, error = %error, "Negotiation protocol violation");
            metrics().protocol_error();
            notifications.protocol_errors
        }
        OefError::Schema(_) => {
            warn!(agent_id = %agent_id, operation = %operation, error = %error, "Rejected operation");
            metrics().registration_failed();
            true
        }
        _ => {
            error!(agent_id = %agent_id, operation = %operation, error = %error, "Operation failed");
            false
        }
    };

    if notify {
        if let Some(reply) = error.to_server_message(operation) {
            state.send(agent_id, reply.answering(msg_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::protocol::{ServerPayload, ServerMessage};
    use crate::schema::{Attribute, AttributeType, DataModel, Instance, QueryModel};
    use tokio::sync::mpsc;

    fn connected(
        state: &mut BrokerState,
        agent_id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(state.connect(agent_id, tx));
        rx
    }

    fn bogus_instance() -> Instance {
        serde_json::from_value(serde_json::json!({
            "model": {"name": "car", "attributes": [
                {"name": "luxury", "type": "bool", "required": true}
            ], "description": ""},
            "values": {"luxury": {"string": "very"}}
        }))
        .unwrap()
    }

    #[test]
    fn test_empty_envelope_is_dropped() {
        let mut state = BrokerState::default();
        let mut rx = connected(&mut state, "Agent1");

        let envelope = Envelope {
            msg_id: 3,
            payload: None,
        };
        assert!(dispatch(&mut state, "Agent1", envelope).is_ok());
        assert!(rx.try_recv().is_err());
        assert!(state.is_connected("Agent1"));
    }

    #[test]
    fn test_invalid_description_gets_error_reply() {
        let mut state = BrokerState::default();
        let mut rx = connected(&mut state, "Agent1");

        let envelope = Envelope::register_description(bogus_instance()).with_msg_id(9);
        assert!(dispatch(&mut state, "Agent1", envelope).is_err());

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.answer_id, 9);
        match reply.payload {
            Some(ServerPayload::Error(e)) => {
                assert_eq!(e.operation, ErrorOperation::RegisterDescription)
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(state.stats().identities, 0);
    }

    #[test]
    fn test_search_answers_the_searcher() {
        let mut state = BrokerState::default();
        let mut rx = connected(&mut state, "Agent1");
        let model = DataModel::new(
            "car",
            vec![Attribute::new("luxury", AttributeType::Bool, true)],
            "",
        )
        .unwrap();
        let query = QueryModel::new(vec![], Some(model)).unwrap();

        dispatch(&mut state, "Agent1", Envelope::search_services(42, query).with_msg_id(2))
            .unwrap();

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply, ServerMessage::search_result(42, vec![]).answering(2));
    }

    #[test]
    fn test_routing_error_notification_follows_config() {
        let mut state = BrokerState::new(NotificationConfig {
            routing_errors: false,
            protocol_errors: false,
        });
        let mut rx = connected(&mut state, "Agent1");

        let result = dispatch(&mut state, "Agent1", Envelope::content("c1", "ghost", "hi"));
        assert!(result.is_err());
        assert!(rx.try_recv().is_err());

        let mut state = BrokerState::default();
        let mut rx = connected(&mut state, "Agent1");
        let _ = dispatch(&mut state, "Agent1", Envelope::content("c1", "ghost", "hi"));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::dialogue_error("c1", "ghost")
        );
    }

    #[test]
    fn test_protocol_error_notification_is_opt_in() {
        let mut state = BrokerState::default();
        let mut rx1 = connected(&mut state, "Agent1");
        let _rx2 = connected(&mut state, "Agent2");

        let _ = dispatch(&mut state, "Agent1", Envelope::accept("c1", "Agent2", 1, 0));
        assert!(rx1.try_recv().is_err());

        let mut state = BrokerState::new(NotificationConfig {
            routing_errors: true,
            protocol_errors: true,
        });
        let mut rx1 = connected(&mut state, "Agent1");
        let _rx2 = connected(&mut state, "Agent2");

        let _ = dispatch(&mut state, "Agent1", Envelope::accept("c1", "Agent2", 1, 0));
        assert_eq!(
            rx1.try_recv().unwrap(),
            ServerMessage::error(ErrorOperation::SendMessage, Some("c1".to_string()), Some(1))
        );
    }

    #[test]
    fn test_decode_envelope_rejects_garbage() {
        assert!(matches!(
            decode_envelope(b"{not json"),
            Err(CodecError::Decode(_))
        ));
        let envelope = decode_envelope(br#"{"payload": "unregister_description"}"#).unwrap();
        assert_eq!(envelope, Envelope::unregister_description());
    }
}

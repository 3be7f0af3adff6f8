//! Connection handshake
//!
//! ```text
//! agent                         broker
//!   AgentIdentifier{public_key} ->
//!                               <- ChallengePhrase::Phrase(random) | Failure
//!   ChallengeResponse{answer}   ->
//!                               <- ConnectionResult{status}
//! ```
//!
//! The answer is the phrase reversed. It stands in for a signature and proves
//! nothing. The exchange runs to completion, under its own deadline, before
//! the stream is handed to the session loop; a session only exists once the
//! broker has sent `status: true`.

use crate::config::validate_agent_id;
use crate::handshake_span;
use crate::observability::metrics;
use crate::protocol::codec::{recv_message, send_message};
use crate::protocol::{
    AgentIdentifier, ChallengePhrase, ChallengeResponse, CodecError, ConnectionResult,
};
use crate::scheduler::{Outbound, SchedulerError, SchedulerHandle};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("Handshake transport error: {0}")]
    Codec(#[from] CodecError),
    #[error("Invalid agent id '{0}'")]
    InvalidAgentId(String),
    #[error("Wrong answer to challenge from '{0}'")]
    WrongAnswer(String),
    #[error("Agent '{0}' is already connected")]
    AlreadyConnected(String),
    #[error("Connection refused by broker")]
    Refused,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Fresh random challenge phrase
pub fn new_challenge() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Placeholder response scheme: the phrase reversed
pub fn answer_challenge(phrase: &str) -> String {
    phrase.chars().rev().collect()
}

/// Broker side. Runs the exchange and admits the agent through the
/// scheduler, returning its id once `status: true` has been sent.
pub async fn accept<S>(
    stream: &mut S,
    scheduler: &SchedulerHandle,
    outbound: Outbound,
    max_frame: usize,
    deadline: Duration,
) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = accept_inner(stream, scheduler, outbound, max_frame, deadline).await;
    if let Err(e) = &result {
        warn!(error = %e, "Handshake failed");
        metrics().handshake_failed();
    }
    result
}

async fn accept_inner<S>(
    stream: &mut S,
    scheduler: &SchedulerHandle,
    outbound: Outbound,
    max_frame: usize,
    deadline: Duration,
) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let agent_id = timeout(deadline, challenge(stream, max_frame))
        .await
        .map_err(|_| HandshakeError::Timeout(deadline))??;

    let admitted = scheduler.connect(agent_id.as_str(), outbound).await?;
    let reply = ConnectionResult { status: admitted };
    let sent = timeout(deadline, send_message(stream, &reply, max_frame)).await;

    match (admitted, sent) {
        (true, Ok(Ok(()))) => {
            info!(agent_id = %agent_id, "Handshake complete");
            Ok(agent_id)
        }
        (true, Ok(Err(e))) => {
            scheduler.disconnect(agent_id.as_str())?;
            Err(e.into())
        }
        (true, Err(_)) => {
            scheduler.disconnect(agent_id.as_str())?;
            Err(HandshakeError::Timeout(deadline))
        }
        (false, _) => Err(HandshakeError::AlreadyConnected(agent_id)),
    }
}

/// Identifier, challenge and answer; everything before admission
async fn challenge<S>(stream: &mut S, max_frame: usize) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identifier: AgentIdentifier = recv_message(stream, max_frame).await?;
    let span = handshake_span!(identifier.public_key);
    verify(stream, identifier.public_key, max_frame)
        .instrument(span)
        .await
}

async fn verify<S>(stream: &mut S, agent_id: String, max_frame: usize) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if validate_agent_id(&agent_id).is_err() {
        send_message(stream, &ChallengePhrase::Failure, max_frame).await?;
        return Err(HandshakeError::InvalidAgentId(agent_id));
    }

    let phrase = new_challenge();
    send_message(stream, &ChallengePhrase::Phrase(phrase.clone()), max_frame).await?;

    let response: ChallengeResponse = recv_message(stream, max_frame).await?;
    if response.answer != answer_challenge(&phrase) {
        send_message(stream, &ConnectionResult { status: false }, max_frame).await?;
        return Err(HandshakeError::WrongAnswer(agent_id));
    }
    debug!("Challenge answered");
    Ok(agent_id)
}

/// Agent side. Completes when the broker has admitted the agent.
pub async fn perform<S>(
    stream: &mut S,
    public_key: &str,
    max_frame: usize,
    deadline: Duration,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(deadline, exchange(stream, public_key, max_frame))
        .instrument(handshake_span!(public_key))
        .await
        .map_err(|_| HandshakeError::Timeout(deadline))?
}

async fn exchange<S>(stream: &mut S, public_key: &str, max_frame: usize) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identifier = AgentIdentifier {
        public_key: public_key.to_string(),
    };
    send_message(stream, &identifier, max_frame).await?;

    let phrase = match recv_message::<_, ChallengePhrase>(stream, max_frame).await? {
        ChallengePhrase::Phrase(phrase) => phrase,
        ChallengePhrase::Failure => return Err(HandshakeError::Refused),
    };
    let response = ChallengeResponse {
        answer: answer_challenge(&phrase),
    };
    send_message(stream, &response, max_frame).await?;

    let result: ConnectionResult = recv_message(stream, max_frame).await?;
    if result.status {
        Ok(())
    } else {
        Err(HandshakeError::Refused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
    use crate::scheduler::Scheduler;
    use tokio::sync::mpsc;

    const DEADLINE: Duration = Duration::from_secs(2);

    #[test]
    fn test_answer_reverses_phrase() {
        assert_eq!(answer_challenge("abc123"), "321cba");
        let phrase = new_challenge();
        assert_eq!(phrase.len(), 32);
        assert_ne!(phrase, new_challenge());
    }

    #[tokio::test]
    async fn test_handshake_admits_agent() {
        let scheduler = Scheduler::spawn(&BrokerConfig::default());
        let handle = scheduler.handle();
        let (mut agent, mut broker) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();

        let (client, server) = tokio::join!(
            perform(&mut agent, "Agent1", DEFAULT_MAX_FRAME_BYTES, DEADLINE),
            accept(&mut broker, &handle, tx, DEFAULT_MAX_FRAME_BYTES, DEADLINE),
        );

        assert!(client.is_ok());
        assert_eq!(server.unwrap(), "Agent1");
        assert_eq!(handle.stats().await.unwrap().sessions, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_agent_is_refused() {
        let scheduler = Scheduler::spawn(&BrokerConfig::default());
        let handle = scheduler.handle();
        let (tx, _rx) = mpsc::unbounded_channel();
        handle.connect("Agent1", tx.clone()).await.unwrap();

        let (mut agent, mut broker) = tokio::io::duplex(4096);
        let (client, server) = tokio::join!(
            perform(&mut agent, "Agent1", DEFAULT_MAX_FRAME_BYTES, DEADLINE),
            accept(&mut broker, &handle, tx, DEFAULT_MAX_FRAME_BYTES, DEADLINE),
        );

        assert!(matches!(client, Err(HandshakeError::Refused)));
        assert!(matches!(server, Err(HandshakeError::AlreadyConnected(_))));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_id_gets_failure_phrase() {
        let scheduler = Scheduler::spawn(&BrokerConfig::default());
        let handle = scheduler.handle();
        let (mut agent, mut broker) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();

        let (client, server) = tokio::join!(
            perform(&mut agent, "not valid", DEFAULT_MAX_FRAME_BYTES, DEADLINE),
            accept(&mut broker, &handle, tx, DEFAULT_MAX_FRAME_BYTES, DEADLINE),
        );

        assert!(matches!(client, Err(HandshakeError::Refused)));
        assert!(matches!(server, Err(HandshakeError::InvalidAgentId(_))));
        assert_eq!(handle.stats().await.unwrap().sessions, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_answer_is_rejected() {
        let scheduler = Scheduler::spawn(&BrokerConfig::default());
        let handle = scheduler.handle();
        let (mut agent, mut broker) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();

        let cheat = async {
            let id = AgentIdentifier {
                public_key: "Agent1".to_string(),
            };
            send_message(&mut agent, &id, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
            let _: ChallengePhrase = recv_message(&mut agent, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
            let answer = ChallengeResponse {
                answer: "guess".to_string(),
            };
            send_message(&mut agent, &answer, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
            let result: ConnectionResult =
                recv_message(&mut agent, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
            result.status
        };

        let (status, server) = tokio::join!(
            cheat,
            accept(&mut broker, &handle, tx, DEFAULT_MAX_FRAME_BYTES, DEADLINE),
        );

        assert!(!status);
        assert!(matches!(server, Err(HandshakeError::WrongAnswer(_))));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let scheduler = Scheduler::spawn(&BrokerConfig::default());
        let handle = scheduler.handle();
        let (_agent, mut broker) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = accept(
            &mut broker,
            &handle,
            tx,
            DEFAULT_MAX_FRAME_BYTES,
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
        scheduler.shutdown().await;
    }
}

//! In-process broker tests: agents talk to the scheduler through LocalProxy

mod test_helpers;

use oef_core::config::BrokerConfig;
use oef_core::conversation::Dialogue;
use oef_core::protocol::{CfpPayload, ServerMessage, ServerPayload};
use oef_core::proxy::{AgentHandler, LocalProxy, OefCore};
use oef_core::scheduler::{Scheduler, SchedulerError, SchedulerHandle};
use oef_core::testing::{HandlerEvent, RecordingHandler, ScriptedSeller};
use oef_core::{OefError, OefResult};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct LocalAgent {
    proxy: Arc<LocalProxy>,
    recorder: RecordingHandler,
    task: JoinHandle<OefResult<()>>,
}

async fn join_with<H, F>(handle: &SchedulerHandle, agent_id: &str, make_handler: F) -> LocalAgent
where
    H: AgentHandler + 'static,
    F: FnOnce(RecordingHandler) -> H,
{
    let proxy = Arc::new(LocalProxy::new(agent_id, handle.clone()));
    proxy.handshake().await.unwrap();

    let recorder = RecordingHandler::new();
    let mut handler = make_handler(recorder.clone());
    let runner = proxy.clone();
    let task = tokio::spawn(async move { runner.run(&mut handler).await });
    LocalAgent {
        proxy,
        recorder,
        task,
    }
}

async fn join(handle: &SchedulerHandle, agent_id: &str) -> LocalAgent {
    join_with(handle, agent_id, |recorder| recorder).await
}

#[tokio::test]
async fn test_local_agents_search_and_negotiate() {
    let scheduler = Scheduler::spawn(&broker_config());
    let handle = scheduler.handle();

    let seller = join_with(&handle, "Seller", |recorder| {
        ScriptedSeller::new(vec![car("Ferrari", true)], recorder)
    })
    .await;
    let buyer = join(&handle, "Buyer").await;

    seller
        .proxy
        .register_service(car("Ferrari", true))
        .await
        .unwrap();
    buyer.proxy.search_services(1, luxury_query()).await.unwrap();
    buyer.recorder.wait_for(1, WAIT).await;
    assert_eq!(
        buyer.recorder.search_result(1).await,
        Some(vec!["Seller".to_string()])
    );

    let mut dialogue = Dialogue::initiate("Seller");
    let conversation_id = dialogue.conversation_id();
    let cfp_id = dialogue.next_msg_id();
    buyer
        .proxy
        .send_cfp(&conversation_id, "Seller", CfpPayload::Nothing, cfp_id, 0)
        .await
        .unwrap();

    let events = buyer.recorder.wait_for(2, WAIT).await;
    let HandlerEvent::Propose { msg_id, target, .. } = &events[1] else {
        panic!("expected a proposal, got {:?}", events[1]);
    };
    assert_eq!((*msg_id, *target), (1, 1));

    dialogue.record_received(*msg_id);
    buyer
        .proxy
        .send_decline(
            &conversation_id,
            "Seller",
            dialogue.next_msg_id(),
            dialogue.reply_target(),
        )
        .await
        .unwrap();

    let seller_events = seller.recorder.wait_for(2, WAIT).await;
    assert!(matches!(seller_events[1], HandlerEvent::Decline { msg_id: 2, target: 1, .. }));
    assert_eq!(handle.stats().await.unwrap().conversations, 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_local_duplicate_id_is_refused() {
    let scheduler = Scheduler::spawn(&broker_config());
    let handle = scheduler.handle();
    let _first = join(&handle, "Agent1").await;

    let second = LocalProxy::new("Agent1", handle.clone());
    let err = second.handshake().await.unwrap_err();
    assert!(matches!(err, OefError::Handshake(_)), "got {err:?}");

    let invalid = LocalProxy::new("", handle.clone());
    assert!(matches!(
        invalid.handshake().await.unwrap_err(),
        OefError::Config(_)
    ));
}

#[tokio::test]
async fn test_local_stop_ends_run_loop_and_cleans_up() {
    let scheduler = Scheduler::spawn(&broker_config());
    let handle = scheduler.handle();
    let agent = join(&handle, "Agent1").await;

    agent
        .proxy
        .register_description(weather_station("Youshiko", true))
        .await
        .unwrap();
    assert_eq!(handle.stats().await.unwrap().identities, 1);

    agent.proxy.stop().await.unwrap();
    let finished = tokio::time::timeout(WAIT, agent.task).await.unwrap();
    assert!(finished.unwrap().is_ok());

    let stats = handle.stats().await.unwrap();
    assert_eq!((stats.sessions, stats.identities), (0, 0));
    assert!(handle
        .search_agents(manufacturer_query("Youshiko"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_messages_keep_submission_order() {
    let scheduler = Scheduler::spawn(&broker_config());
    let handle = scheduler.handle();

    let (tx, mut rx) = mpsc::unbounded_channel();
    assert!(handle.connect("Receiver", tx).await.unwrap());
    let (sender_tx, _sender_rx) = mpsc::unbounded_channel();
    assert!(handle.connect("Sender", sender_tx).await.unwrap());

    for i in 0..100 {
        let envelope = oef_core::protocol::Envelope::content("c", "Receiver", i.to_string())
            .with_msg_id(i + 1);
        handle.submit("Sender", envelope).unwrap();
    }
    // Replies to the agent's own session interleave in queue order too
    handle
        .send("Receiver", ServerMessage::search_result(42, vec![]))
        .unwrap();
    handle.stats().await.unwrap();

    let mut received = Vec::new();
    while let Ok(message) = rx.try_recv() {
        received.push(message);
    }
    assert_eq!(received.len(), 101);
    for (i, message) in received.iter().take(100).enumerate() {
        match &message.payload {
            Some(ServerPayload::Content(delivery)) => {
                assert_eq!(delivery.origin, "Sender");
                assert_eq!(
                    delivery.body,
                    oef_core::protocol::MessageBody::Content(i.to_string())
                );
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
    assert!(matches!(
        received[100].payload,
        Some(ServerPayload::SearchResult(_))
    ));
}

#[tokio::test]
async fn test_send_to_reports_missing_destination() {
    let scheduler = Scheduler::spawn(&broker_config());
    let handle = scheduler.handle();
    let (tx, _rx) = mpsc::unbounded_channel();
    handle.connect("Agent1", tx).await.unwrap();

    let delivered = handle
        .send_to("Agent1", "Nobody", ServerMessage::search_result(1, vec![]))
        .await
        .unwrap();
    assert!(!delivered);
}

#[tokio::test]
async fn test_handle_fails_after_shutdown() {
    let scheduler = Scheduler::spawn(&broker_config());
    let handle = scheduler.handle();
    scheduler.shutdown().await;

    assert!(handle.is_stopped());
    assert_eq!(handle.stats().await, Err(SchedulerError::Stopped));
    let (tx, _rx) = mpsc::unbounded_channel();
    assert_eq!(
        handle.connect("Agent1", tx).await,
        Err(SchedulerError::Stopped)
    );

    let proxy = LocalProxy::new("Agent1", handle);
    assert!(matches!(
        proxy.handshake().await.unwrap_err(),
        OefError::Scheduler(SchedulerError::Stopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_idle_conversations_are_swept() {
    let mut config: BrokerConfig = broker_config();
    config.conversations.idle_timeout_secs = Some(60);
    config.conversations.sweep_interval_secs = 5;
    let scheduler = Scheduler::spawn(&config);
    let handle = scheduler.handle();

    let buyer = join(&handle, "Buyer").await;
    let seller = join(&handle, "Seller").await;

    let dialogue = Dialogue::initiate("Seller");
    buyer
        .proxy
        .send_cfp(&dialogue.conversation_id(), "Seller", CfpPayload::Nothing, 1, 0)
        .await
        .unwrap();
    seller.recorder.wait_for(1, WAIT).await;
    assert_eq!(handle.stats().await.unwrap().conversations, 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.stats().await.unwrap().conversations, 1);

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(handle.stats().await.unwrap().conversations, 0);

    // Replying into the expired conversation is now an unknown-conversation error
    seller
        .proxy
        .send_propose(
            &dialogue.conversation_id(),
            "Buyer",
            oef_core::protocol::ProposePayload::Content("late".to_string()),
            1,
            1,
        )
        .await
        .unwrap();
    let events = seller.recorder.wait_for(2, WAIT).await;
    assert!(matches!(events[1], HandlerEvent::Error { .. }));
}

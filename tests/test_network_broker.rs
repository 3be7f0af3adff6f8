//! End-to-end tests: real TCP broker, agents connected through NetworkProxy

mod test_helpers;

use oef_core::config::ClientConfig;
use oef_core::conversation::Dialogue;
use oef_core::protocol::{CfpPayload, ErrorOperation, ProposePayload};
use oef_core::proxy::{NetworkProxy, OefCore};
use oef_core::testing::{HandlerEvent, ScriptedSeller};
use oef_core::OefError;
use test_helpers::*;

#[tokio::test]
async fn test_luxury_car_search_finds_both_sellers() {
    let broker = start_broker(broker_config()).await;
    let agent1 = connect_agent(broker.addr, "Agent1").await;
    let agent2 = connect_agent(broker.addr, "Agent2").await;
    let agent3 = connect_agent(broker.addr, "Agent3").await;

    agent1
        .proxy
        .register_service(car("Ferrari", true))
        .await
        .unwrap();
    agent2
        .proxy
        .register_service(car("Lamborghini", true))
        .await
        .unwrap();
    let stats = wait_for_stats(&broker.handle, |s| s.services == 2).await;
    assert_eq!(stats.services, 2);

    agent3.proxy.search_services(1, luxury_query()).await.unwrap();
    agent3.recorder.wait_for(1, WAIT).await;

    let found = agent3.recorder.search_result(1).await.unwrap();
    assert_eq!(sorted(found), vec!["Agent1".to_string(), "Agent2".to_string()]);
}

#[tokio::test]
async fn test_identity_search_on_manufacturer_only() {
    let broker = start_broker(broker_config()).await;
    let agent1 = connect_agent(broker.addr, "Agent1").await;
    let agent2 = connect_agent(broker.addr, "Agent2").await;
    let searcher = connect_agent(broker.addr, "Searcher").await;

    agent1
        .proxy
        .register_description(weather_station("Youshiko", true))
        .await
        .unwrap();
    agent2
        .proxy
        .register_description(weather_station("Opes", true))
        .await
        .unwrap();
    wait_for_stats(&broker.handle, |s| s.identities == 2).await;

    searcher
        .proxy
        .search_agents(7, manufacturer_query("Youshiko"))
        .await
        .unwrap();
    searcher.recorder.wait_for(1, WAIT).await;

    assert_eq!(
        searcher.recorder.search_result(7).await,
        Some(vec!["Agent1".to_string()])
    );
}

#[tokio::test]
async fn test_service_and_identity_namespaces_are_separate() {
    let broker = start_broker(broker_config()).await;
    let seller = connect_agent(broker.addr, "Seller").await;
    let searcher = connect_agent(broker.addr, "Searcher").await;

    seller
        .proxy
        .register_service(weather_station("Youshiko", true))
        .await
        .unwrap();
    wait_for_stats(&broker.handle, |s| s.services == 1).await;

    searcher
        .proxy
        .search_agents(1, manufacturer_query("Youshiko"))
        .await
        .unwrap();
    searcher
        .proxy
        .search_services(2, manufacturer_query("Youshiko"))
        .await
        .unwrap();
    searcher.recorder.wait_for(2, WAIT).await;

    assert_eq!(searcher.recorder.search_result(1).await, Some(vec![]));
    assert_eq!(
        searcher.recorder.search_result(2).await,
        Some(vec!["Seller".to_string()])
    );
}

#[tokio::test]
async fn test_full_negotiation_ends_conversation() {
    let broker = start_broker(broker_config()).await;
    let offers = vec![car_with_year("Ferrari", 2019, true)];
    let seller = connect_agent_with(broker.addr, "Seller", |recorder| {
        ScriptedSeller::new(offers.clone(), recorder)
    })
    .await;
    let buyer = connect_agent(broker.addr, "Buyer").await;

    let mut dialogue = Dialogue::initiate("Seller");
    let conversation_id = dialogue.conversation_id();
    let cfp_id = dialogue.next_msg_id();
    buyer
        .proxy
        .send_cfp(
            &conversation_id,
            "Seller",
            CfpPayload::Query(luxury_query()),
            cfp_id,
            dialogue.reply_target(),
        )
        .await
        .unwrap();

    let events = buyer.recorder.wait_for(1, WAIT).await;
    let (propose_id, propose_target) = match &events[0] {
        HandlerEvent::Propose {
            origin,
            conversation_id: conv,
            msg_id,
            target,
            payload: ProposePayload::Proposals(proposals),
        } => {
            assert_eq!(origin, "Seller");
            assert_eq!(conv, &conversation_id);
            assert_eq!(proposals, &offers);
            (*msg_id, *target)
        }
        other => panic!("expected a proposal, got {other:?}"),
    };
    assert_eq!((propose_id, propose_target), (1, cfp_id));
    assert_eq!(broker.handle.stats().await.unwrap().conversations, 1);

    dialogue.record_received(propose_id);
    let accept_id = dialogue.next_msg_id();
    buyer
        .proxy
        .send_accept(&conversation_id, "Seller", accept_id, dialogue.reply_target())
        .await
        .unwrap();

    let seller_events = seller.recorder.wait_for(2, WAIT).await;
    assert_eq!(
        seller_events[1],
        HandlerEvent::Accept {
            origin: "Buyer".to_string(),
            conversation_id: conversation_id.clone(),
            msg_id: 2,
            target: 1,
        }
    );

    let stats = wait_for_stats(&broker.handle, |s| s.conversations == 0).await;
    assert_eq!(stats.conversations, 0);
}

#[tokio::test]
async fn test_message_to_absent_agent_gets_dialogue_error() {
    let broker = start_broker(broker_config()).await;
    let agent = connect_agent(broker.addr, "Agent1").await;

    agent
        .proxy
        .send_message("conv-1", "Nobody", "hello?")
        .await
        .unwrap();

    let events = agent.recorder.wait_for(1, WAIT).await;
    assert_eq!(
        events,
        vec![HandlerEvent::DialogueError {
            answer_id: 1,
            conversation_id: "conv-1".to_string(),
            destination: "Nobody".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_plain_message_is_relayed_with_origin() {
    let broker = start_broker(broker_config()).await;
    let sender = connect_agent(broker.addr, "Sender").await;
    let receiver = connect_agent(broker.addr, "Receiver").await;

    sender
        .proxy
        .send_message("chat", "Receiver", "first")
        .await
        .unwrap();
    sender
        .proxy
        .send_message("chat", "Receiver", "second")
        .await
        .unwrap();

    let events = receiver.recorder.wait_for(2, WAIT).await;
    let contents: Vec<_> = events
        .iter()
        .map(|event| match event {
            HandlerEvent::Message {
                origin, content, ..
            } => {
                assert_eq!(origin, "Sender");
                content.as_str()
            }
            other => panic!("expected a message, got {other:?}"),
        })
        .collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert!(sender.recorder.events().await.is_empty());
}

#[tokio::test]
async fn test_out_of_order_reply_is_reported_when_enabled() {
    let broker = start_broker(broker_config()).await;
    let buyer = connect_agent(broker.addr, "Buyer").await;
    let seller = connect_agent(broker.addr, "Seller").await;

    let dialogue = Dialogue::initiate("Seller");
    let conversation_id = dialogue.conversation_id();
    buyer
        .proxy
        .send_cfp(&conversation_id, "Seller", CfpPayload::Nothing, 1, 0)
        .await
        .unwrap();
    seller.recorder.wait_for(1, WAIT).await;

    // Nothing with msg_id 2 was ever sent
    seller
        .proxy
        .send_propose(
            &conversation_id,
            "Buyer",
            ProposePayload::Content("100 FET".to_string()),
            1,
            2,
        )
        .await
        .unwrap();

    let events = seller.recorder.wait_for(2, WAIT).await;
    assert_eq!(
        events[1],
        HandlerEvent::Error {
            answer_id: 1,
            operation: ErrorOperation::SendMessage,
            conversation_id: Some(conversation_id),
            msg_id: Some(1),
        }
    );
    assert!(buyer.recorder.events().await.is_empty());
}

#[tokio::test]
async fn test_invalid_registration_is_rejected() {
    let broker = start_broker(broker_config()).await;
    let agent = connect_agent(broker.addr, "Agent1").await;

    let missing_required: oef_core::schema::Instance = serde_json::from_value(serde_json::json!({
        "model": {
            "name": "car",
            "attributes": [
                {"name": "manufacturer", "type": "string", "required": true},
                {"name": "luxury", "type": "bool", "required": true}
            ],
            "description": ""
        },
        "values": {"manufacturer": {"string": "Ferrari"}}
    }))
    .unwrap();

    agent.proxy.register_description(missing_required).await.unwrap();

    let events = agent.recorder.wait_for(1, WAIT).await;
    assert!(matches!(
        events[0],
        HandlerEvent::Error {
            operation: ErrorOperation::RegisterDescription,
            ..
        }
    ));
    assert_eq!(broker.handle.stats().await.unwrap().identities, 0);
}

#[tokio::test]
async fn test_disconnect_removes_registrations() {
    let broker = start_broker(broker_config()).await;
    let seller = connect_agent(broker.addr, "Agent1").await;
    let searcher = connect_agent(broker.addr, "Searcher").await;

    seller
        .proxy
        .register_service(car("Ferrari", true))
        .await
        .unwrap();
    wait_for_stats(&broker.handle, |s| s.services == 1).await;

    seller.proxy.stop().await.unwrap();
    let stats = wait_for_stats(&broker.handle, |s| s.sessions == 1).await;
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.services, 0);

    searcher.proxy.search_services(3, luxury_query()).await.unwrap();
    searcher.recorder.wait_for(1, WAIT).await;
    assert_eq!(searcher.recorder.search_result(3).await, Some(vec![]));
}

#[tokio::test]
async fn test_second_session_with_same_id_is_refused() {
    let broker = start_broker(broker_config()).await;
    let _first = connect_agent(broker.addr, "Agent1").await;

    let duplicate = NetworkProxy::new(ClientConfig::new(format!("tcp://{}", broker.addr), "Agent1"));
    let err = duplicate.handshake().await.unwrap_err();
    assert!(matches!(err, OefError::Handshake(_)), "got {err:?}");
    assert_eq!(broker.handle.stats().await.unwrap().sessions, 1);
}

#[tokio::test]
async fn test_invalid_agent_id_is_not_admitted() {
    let broker = start_broker(broker_config()).await;

    let proxy = NetworkProxy::new(ClientConfig::new(
        format!("tcp://{}", broker.addr),
        "has spaces",
    ));
    assert!(proxy.handshake().await.is_err());
    assert_eq!(broker.handle.stats().await.unwrap().sessions, 0);
}

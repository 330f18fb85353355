//! Full sharer/requester handshake over the in-memory network.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;

use pairing_core::error::{PairingError, ServiceError};
use pairing_core::pairing::{
    Outcome, PairingContext, Requester, RequesterState, Sharer, SharerOutcome, SharerState, Stage,
};
use pairing_core::service::memory::{MemoryNetwork, Operation};
use pairing_core::service::{ContactRequest, EventType, GroupType, ProtocolService};

#[tokio::test]
async fn test_requester_hello_reaches_sharer() {
    let network = MemoryNetwork::new();
    let sharer_node = network.join().unwrap();
    let requester_node = network.join().unwrap();

    let (token_tx, token_rx) = oneshot::channel();
    let sharer = Sharer::new(sharer_node.clone(), PairingContext::new());
    let sharer_task = tokio::spawn(sharer.run(move |token: &str| {
        let _ = token_tx.send(token.to_string());
    }));

    let token = token_rx.await.unwrap();
    let requester = Requester::new(requester_node.clone(), PairingContext::new());
    let sent = requester.run(&token, b"Hello").await.unwrap();
    assert_eq!(sent.contact.public_key, sharer_node.account_pk());

    let outcome = tokio::time::timeout(Duration::from_secs(5), sharer_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let group_pk = match outcome {
        SharerOutcome::Paired {
            request,
            group,
            message,
        } => {
            assert_eq!(request.contact_public_key, requester_node.account_pk());
            assert_eq!(group.group, sent.group.group);
            assert_eq!(group.group.group_type, GroupType::Contact);
            assert_eq!(message.payload, b"Hello");
            assert_eq!(message.id, sent.message_id);
            group.group.public_key
        }
        other => panic!("unexpected outcome: {other:?}"),
    };

    // Replay both logs in full: one request and one message, nothing more.
    let account_group_pk = sharer_node
        .service_configuration()
        .await
        .unwrap()
        .account_group_pk;
    let metadata = sharer_node.group_metadata_list(&account_group_pk).await.unwrap();
    let messages = sharer_node.group_message_list(&group_pk).await.unwrap();
    sharer_node.close_subscriptions().unwrap();

    let metadata: Vec<_> = metadata.map(|event| event.unwrap()).collect().await;
    let requests: Vec<_> = metadata
        .iter()
        .filter(|event| event.event_type == EventType::AccountContactRequestIncomingReceived)
        .collect();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        ContactRequest::decode(&requests[0].payload)
            .unwrap()
            .contact_public_key,
        requester_node.account_pk()
    );

    let messages: Vec<_> = messages.map(|event| event.unwrap()).collect().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, b"Hello");
}

#[tokio::test]
async fn test_stage_by_stage() {
    let network = MemoryNetwork::new();
    let mut sharer = Sharer::new(network.join().unwrap(), PairingContext::new());
    let mut requester = Requester::new(network.join().unwrap(), PairingContext::new());

    let token = sharer.share_contact().await.unwrap().to_token().unwrap();
    requester.decode_contact(&token).unwrap();
    requester.send_request(b"bob").await.unwrap();
    assert_eq!(requester.state(), RequesterState::RequestSent);

    // The request is already in the log; the subscription replays it.
    let request = sharer.await_contact_request().await.unwrap().received().unwrap();
    assert_eq!(request.contact_metadata, b"bob");

    let sharer_group = sharer.accept(&request).await.unwrap();
    let requester_group = requester.activate_group().await.unwrap();
    assert_eq!(sharer_group.group, requester_group.group);

    requester.send_message(b"Hello").await.unwrap();
    assert_eq!(requester.state(), RequesterState::Done);

    let message = sharer.await_message().await.unwrap();
    assert_eq!(message.received().unwrap().payload, b"Hello");
    assert_eq!(sharer.state(), SharerState::Done);
}

#[tokio::test]
async fn test_closed_message_stream_is_not_received() {
    let network = MemoryNetwork::new();
    let sharer_node = network.join().unwrap();
    let mut sharer = Sharer::new(sharer_node.clone(), PairingContext::new());
    let mut requester = Requester::new(network.join().unwrap(), PairingContext::new());

    let token = sharer.share_contact().await.unwrap().to_token().unwrap();
    requester.decode_contact(&token).unwrap();
    requester.send_request(b"").await.unwrap();
    let request = sharer.await_contact_request().await.unwrap().received().unwrap();
    sharer.accept(&request).await.unwrap();

    let closer = sharer_node.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close_subscriptions().unwrap();
    });

    assert_eq!(sharer.await_message().await.unwrap(), Outcome::NotReceived);
}

#[tokio::test]
async fn test_cancel_unblocks_sharer() {
    let network = MemoryNetwork::new();
    let ctx = PairingContext::new();
    let mut sharer = Sharer::new(network.join().unwrap(), ctx.child());
    sharer.share_contact().await.unwrap();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = sharer.await_contact_request().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.to_string(), "sharer await-contact-request: cancelled");
}

#[tokio::test]
async fn test_subscription_timeout() {
    let network = MemoryNetwork::new();
    let ctx = PairingContext::new().with_subscription_timeout(Some(Duration::from_millis(20)));
    let mut sharer = Sharer::new(network.join().unwrap(), ctx);
    sharer.share_contact().await.unwrap();

    match sharer.await_contact_request().await {
        Err(PairingError::Timeout { stage, .. }) => assert_eq!(stage, Stage::AwaitContactRequest),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_broken_stream_is_an_error_not_not_received() {
    let network = MemoryNetwork::new();
    let node = network.join().unwrap();
    let mut sharer = Sharer::new(node.clone(), PairingContext::new());
    sharer.share_contact().await.unwrap();

    let breaker = node.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker
            .break_subscriptions(ServiceError::Stream("connection reset".to_string()))
            .unwrap();
    });

    let err = sharer.await_contact_request().await.unwrap_err();
    assert!(matches!(err, PairingError::Subscription { .. }));
    assert_eq!(
        err.to_string(),
        "sharer await-contact-request: subscription failed: Stream error: connection reset"
    );
}

#[tokio::test]
async fn test_accept_failure_is_tagged() {
    let network = MemoryNetwork::new();
    let sharer_node = network.join().unwrap();
    let mut sharer = Sharer::new(sharer_node.clone(), PairingContext::new());
    let mut requester = Requester::new(network.join().unwrap(), PairingContext::new());

    let token = sharer.share_contact().await.unwrap().to_token().unwrap();
    requester.decode_contact(&token).unwrap();
    requester.send_request(b"").await.unwrap();
    let request = sharer.await_contact_request().await.unwrap().received().unwrap();

    sharer_node
        .fail_next(
            Operation::ActivateGroup,
            ServiceError::Rpc("group store unavailable".to_string()),
        )
        .unwrap();
    let err = sharer.accept(&request).await.unwrap_err();
    assert!(matches!(err, PairingError::PairingAcceptFailed { .. }));
    assert!(err.to_string().starts_with("sharer accept-contact:"));
    assert_eq!(sharer.state(), SharerState::Accepting);
}

#[tokio::test]
async fn test_requester_grace_period_holds_after_ack() {
    let network = MemoryNetwork::new();
    let sharer_node = network.join().unwrap();
    let seed = sharer_node.contact_request_enable().await.unwrap();
    let token = pairing_core::ShareableContact::new(sharer_node.account_pk().to_vec(), seed)
        .to_token()
        .unwrap();

    let ctx = PairingContext::new().with_send_grace_period(Duration::from_millis(50));
    let requester = Requester::new(network.join().unwrap(), ctx);

    let started = tokio::time::Instant::now();
    requester.run(&token, b"Hello").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
}

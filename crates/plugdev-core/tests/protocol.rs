mod common;

use common::{packet, FakeRemote, SLOW_ACTOR};
use futures::future::join_all;
use plugdev_core::{
    ClientEvent, ClientOptions, ConnectionState, HarnessError, Packet, ProtocolClient,
};
use serde_json::json;
use std::sync::Arc;

async fn connected(remote: &FakeRemote) -> ProtocolClient {
    let client = ProtocolClient::new(ClientOptions::default());
    client.connect(remote.port).await.unwrap();
    client
}

#[tokio::test]
async fn test_same_actor_requests_are_serialized_on_the_wire() {
    let remote = FakeRemote::start().await;
    let client = connected(&remote).await;

    let first = client.request(Packet::new(SLOW_ACTOR, "echo").with("value", 1));
    let second = client.request(Packet::new(SLOW_ACTOR, "echo").with("value", 2));
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().get("echo"), Some(&json!(1)));
    assert_eq!(second.unwrap().get("echo"), Some(&json!(2)));

    // The second request only left the client after the first reply.
    assert_eq!(
        remote.log(),
        vec![
            "recv slow echo",
            "reply slow echo",
            "recv slow echo",
            "reply slow echo",
        ]
    );
}

#[tokio::test]
async fn test_different_actors_are_independent() {
    let remote = FakeRemote::start().await;
    let client = connected(&remote).await;

    let slow = client.request(Packet::new(SLOW_ACTOR, "echo").with("value", "slow"));
    let fast = client.request(Packet::new("fast", "echo").with("value", "fast"));
    let (slow, fast) = tokio::join!(slow, fast);
    assert!(slow.is_ok());
    assert!(fast.is_ok());

    let log = remote.log();
    let slow_reply = log.iter().position(|l| l == "reply slow echo").unwrap();
    let fast_recv = log.iter().position(|l| l == "recv fast echo").unwrap();
    assert!(fast_recv < slow_reply, "log: {:?}", log);
}

#[tokio::test]
async fn test_error_reply_is_request_error() {
    let remote = FakeRemote::start().await;
    let client = connected(&remote).await;

    let err = client
        .request(Packet::new("root", "frobnicate"))
        .await
        .unwrap_err();
    match err {
        HarnessError::Request { actor, error, .. } => {
            assert_eq!(actor, "root");
            assert_eq!(error.as_deref(), Some("unrecognizedPacketType"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // The connection survives a request error.
    assert_eq!(client.state(), ConnectionState::Connected);
    let root = client.request("getRoot").await.unwrap();
    assert_eq!(root.get_str("addonsActor"), Some(common::ADDONS_ACTOR));
}

#[tokio::test]
async fn test_disconnect_rejects_every_request_exactly_once() {
    let remote = FakeRemote::start().await;
    let client = Arc::new(connected(&remote).await);
    let mut events = client.subscribe();

    let requests: Vec<_> = (0..4)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .request(Packet::new(SLOW_ACTOR, "echo").with("value", i))
                    .await
            })
        })
        .collect();

    // Let the first request reach the wire, then pull the plug.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    client.disconnect().await;
    client.disconnect().await;

    let results = join_all(requests).await;
    for result in results {
        let result = result.unwrap();
        assert!(
            matches!(result, Err(HarnessError::Connection { .. })),
            "{:?}",
            result
        );
    }
    assert_eq!(client.state(), ConnectionState::Closed);

    // Only the in-flight request was ever written.
    assert_eq!(remote.received_kinds(), vec!["echo"]);
    // Disconnecting ourselves is not a peer `end`.
    assert!(!matches!(events.try_recv(), Ok(ClientEvent::End)));
}

#[tokio::test]
async fn test_requests_after_close_fail_fast() {
    let remote = FakeRemote::start().await;
    let client = connected(&remote).await;
    client.disconnect().await;

    assert!(matches!(
        client.request("getRoot").await,
        Err(HarnessError::Connection { .. })
    ));
    assert!(remote.received().is_empty());
}

#[tokio::test]
async fn test_untargeted_request_never_reaches_the_socket() {
    let remote = FakeRemote::start().await;
    let client = connected(&remote).await;

    let err = client
        .request(packet(json!({"type": "getRoot"})))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Request { .. }));

    client.request("getRoot").await.unwrap();
    assert_eq!(remote.received_kinds(), vec!["getRoot"]);
}

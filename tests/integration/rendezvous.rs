use std::time::Duration;

use meshlink_services::testing::RecordingTasks;
use meshlink_services::RendezvousRoute;

use crate::*;

fn set_session_count(link: &MemoryLink) -> usize {
    link.sent_kinds()
        .iter()
        .filter(|k| **k == "set_task_session")
        .count()
}

/// Owner "X" is not connected: both other peers get the delegated request.
#[tokio::test]
async fn unknown_owner_is_delegated_to_every_other_peer() {
    let overlay = Node::start(quiet_config());
    let (_, a) = overlay.connect_inbound("a").await;
    let (_, b) = overlay.connect_inbound("b").await;

    let route = overlay
        .handle
        .want_to_start_task_session("X".into(), node("req"), "conn-1".into(), None)
        .await
        .unwrap();

    assert_eq!(route, RendezvousRoute::Broadcast(2));
    assert_eq!(set_session_count(&a), 1);
    assert_eq!(set_session_count(&b), 1);
}

#[tokio::test]
async fn requester_is_not_asked_to_delegate() {
    let overlay = Node::start(quiet_config());
    let (_, a) = overlay.connect_inbound("a").await;
    let (_, req) = overlay.connect_inbound("req").await;

    let route = overlay
        .handle
        .want_to_start_task_session("X".into(), node("req"), "conn-1".into(), None)
        .await
        .unwrap();

    assert_eq!(route, RendezvousRoute::Broadcast(1));
    assert_eq!(set_session_count(&a), 1);
    assert_eq!(set_session_count(&req), 0);
}

#[tokio::test]
async fn connected_owner_gets_request_directly() {
    let overlay = Node::start(quiet_config());
    let (_, owner) = overlay.connect_inbound("x").await;
    let (_, other) = overlay.connect_inbound("y").await;

    let route = overlay
        .handle
        .want_to_start_task_session("key-x".into(), node("req"), "conn-1".into(), None)
        .await
        .unwrap();

    assert_eq!(route, RendezvousRoute::Direct("x".into()));
    assert!(owner.sent_kinds().contains(&"want_to_start_task_session"));
    assert_eq!(set_session_count(&other), 0);
}

#[tokio::test]
async fn relayed_request_handled_once_per_connection() {
    let overlay = Node::start(quiet_config());
    let (s, _) = overlay.connect_inbound("a").await;
    let (_, b) = overlay.connect_inbound("b").await;

    let relay = PeerMessage::SetTaskSession {
        key_id: "X".into(),
        node: node("req"),
        conn_id: "conn-7".into(),
        super_node: None,
    };
    overlay.deliver(s, relay.clone()).await;
    overlay.deliver(s, relay).await;
    let status = overlay.status().await;

    assert_eq!(status.pending_rendezvous, 1);
    assert_eq!(set_session_count(&b), 1);
}

#[tokio::test]
async fn rendezvous_records_expire_after_ttl() {
    let mut config = quiet_config();
    config.network.rendezvous_ttl_secs = 600;
    let overlay = Node::start(config);
    let (s, _) = overlay.connect_inbound("a").await;

    overlay.deliver(
        s,
        PeerMessage::SetTaskSession {
            key_id: "X".into(),
            node: node("req"),
            conn_id: "conn-9".into(),
            super_node: None,
        },
    )
    .await;
    assert_eq!(overlay.status().await.pending_rendezvous, 1);

    overlay.clock.advance(Duration::from_secs(600));
    assert_eq!(overlay.tick().await.pending_rendezvous, 1);

    overlay.clock.advance(Duration::from_secs(1));
    assert_eq!(overlay.tick().await.pending_rendezvous, 0);
}

#[tokio::test]
async fn request_reaching_owner_goes_to_task_coordinator() {
    let overlay = Node::start(quiet_config());
    let tasks = RecordingTasks::new();
    overlay
        .handle
        .set_task_coordinator(Box::new(tasks.clone()))
        .await
        .unwrap();
    let (s, _) = overlay.connect_inbound("a").await;

    overlay.deliver(
        s,
        PeerMessage::WantToStartTaskSession {
            node: node("req"),
            conn_id: "conn-3".into(),
            super_node: None,
        },
    )
    .await;
    overlay.status().await;

    let state = tasks.state();
    let started = &state.sessions;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].conn_id, "conn-3");
    assert_eq!(started[0].node.node_id, "req");
}

use crate::*;

/// Three pending candidates and a target of three: all promoted, queue drained.
#[tokio::test]
async fn fills_target_from_pending_candidates() {
    let mut config = quiet_config();
    config.network.opt_num_peers = 3;
    let overlay = Node::start(config);

    for id in ["c1", "c2", "c3"] {
        overlay.handle.try_to_add_peer(info(id)).await.unwrap();
    }
    assert_eq!(overlay.status().await.free_candidates, 3);

    for _ in 0..3 {
        overlay.tick().await;
        overlay.complete_dials().await;
    }

    let status = overlay.status().await;
    assert_eq!(status.active_peers, 3);
    assert_eq!(status.free_candidates, 0);

    let service = overlay.stop().await;
    assert!(service.registry().is_consistent());
}

#[tokio::test]
async fn never_dials_more_than_the_deficit() {
    let mut config = quiet_config();
    config.network.opt_num_peers = 2;
    let overlay = Node::start(config);
    overlay.connect_inbound("a").await;

    for id in ["c1", "c2", "c3"] {
        overlay.handle.try_to_add_peer(info(id)).await.unwrap();
    }
    overlay.tick().await;

    assert_eq!(overlay.transport.requests().len(), 1);
    assert_eq!(overlay.status().await.free_candidates, 2);
}

#[tokio::test]
async fn failed_candidate_retried_until_attempts_run_out() {
    let overlay = Node::start(quiet_config());
    overlay.handle.try_to_add_peer(info("c1")).await.unwrap();

    let mut dials = 0;
    for _ in 0..5 {
        overlay.tick().await;
        dials += overlay.fail_dials().await;
    }

    assert_eq!(dials, 3);
    let status = overlay.status().await;
    assert_eq!(status.free_candidates, 0);
    assert_eq!(status.pending_candidates, 1);
}

#[tokio::test]
async fn peers_list_from_a_neighbour_is_dialed() {
    let overlay = Node::start(quiet_config());
    let (session, _) = overlay.connect_inbound("a").await;

    let peers = vec![
        serde_json::to_value(info("c1")).unwrap(),
        serde_json::json!({ "id": 5 }),
        serde_json::to_value(info("local")).unwrap(),
    ];
    overlay.deliver(session, PeerMessage::Peers { peers }).await;
    overlay.tick().await;

    let requests = overlay.transport.take_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].expected.as_deref(), Some("c1"));
}

#[tokio::test]
async fn empty_queue_asks_active_peers() {
    let overlay = Node::start(quiet_config());
    let (_, a) = overlay.connect_inbound("a").await;
    a.take_sent();

    overlay.clock.advance(std::time::Duration::from_secs(5));
    overlay.tick().await;

    assert!(a.sent_kinds().contains(&"get_peers"));
}

#[tokio::test]
async fn routing_eviction_closes_session() {
    let overlay = Node::start(quiet_config());
    let (_, a) = overlay.connect_inbound("a").await;
    overlay.connect_inbound("b").await;

    overlay.routing.script().sessions_to_end.push("a".to_string());
    let status = overlay.tick().await;

    assert_eq!(
        a.disconnect_reason(),
        Some(meshlink_core::DisconnectReason::Timeout)
    );
    assert_eq!(status.active_peers, 1);
    assert_eq!(status.peers[0].id, "b");
}

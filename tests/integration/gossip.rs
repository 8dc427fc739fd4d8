use std::collections::HashSet;

use meshlink_core::LocalRank;
use serde_json::json;

use crate::*;

/// Five gossips heard, one drain returns all five, the next returns nothing.
#[tokio::test]
async fn gossip_drained_once() {
    let overlay = Node::start(quiet_config());
    let (s, _) = overlay.connect_inbound("a").await;

    for i in 0..5 {
        overlay
            .deliver(s, PeerMessage::Gossip { gossip: json!({ "round": i }) })
            .await;
    }

    let first = overlay.handle.drain_gossip().await.unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(first[0]["round"], 0);
    assert!(overlay.handle.drain_gossip().await.unwrap().is_empty());
}

#[tokio::test]
async fn gossip_only_reaches_connected_recipients() {
    let overlay = Node::start(quiet_config());
    let (_, a) = overlay.connect_inbound("a").await;
    let (_, b) = overlay.connect_inbound("b").await;
    a.take_sent();
    b.take_sent();

    overlay
        .handle
        .send_gossip(json!(["x"]), vec!["a".into(), "ghost".into()])
        .await
        .unwrap();
    overlay.status().await;

    assert_eq!(a.sent_kinds(), vec!["gossip"]);
    assert!(b.sent().is_empty());
}

#[tokio::test]
async fn stop_gossip_senders_collected_as_a_set() {
    let overlay = Node::start(quiet_config());
    let (sa, _) = overlay.connect_inbound("a").await;
    let (sb, _) = overlay.connect_inbound("b").await;

    overlay.deliver(sa, PeerMessage::StopGossip).await;
    overlay.deliver(sa, PeerMessage::StopGossip).await;
    overlay.deliver(sb, PeerMessage::StopGossip).await;

    let stopped = overlay.handle.drain_stop_gossip().await.unwrap();
    let expected: HashSet<String> = ["a".to_string(), "b".to_string()].into();
    assert_eq!(stopped, expected);
    assert!(overlay.handle.drain_stop_gossip().await.unwrap().is_empty());
}

#[tokio::test]
async fn broadcast_stop_gossip_reaches_every_peer() {
    let overlay = Node::start(quiet_config());
    let (_, a) = overlay.connect_inbound("a").await;
    let (_, b) = overlay.connect_inbound("b").await;

    overlay.handle.broadcast_stop_gossip().await.unwrap();
    overlay.status().await;

    assert!(a.sent_kinds().contains(&"stop_gossip"));
    assert!(b.sent_kinds().contains(&"stop_gossip"));
}

#[tokio::test]
async fn local_ranks_pushed_and_neighbour_ranks_collected() {
    let overlay = Node::start(quiet_config());
    let (sa, a) = overlay.connect_inbound("a").await;
    a.take_sent();

    let rank = LocalRank {
        computing_trust: 0.5,
        requesting_trust: -0.25,
    };
    overlay.handle.push_local_rank("z".into(), rank).await.unwrap();
    overlay.status().await;
    assert_eq!(
        a.sent(),
        vec![PeerMessage::LocRank {
            node_id: "z".into(),
            loc_rank: rank
        }]
    );

    overlay
        .deliver(
            sa,
            PeerMessage::LocRank {
                node_id: "w".into(),
                loc_rank: rank,
            },
        )
        .await;
    let ranks = overlay.handle.drain_neighbour_ranks().await.unwrap();
    assert_eq!(ranks.len(), 1);
    assert_eq!(ranks[0].neighbour, "a");
    assert_eq!(ranks[0].subject, "w");
    assert!(overlay.handle.drain_neighbour_ranks().await.unwrap().is_empty());
}

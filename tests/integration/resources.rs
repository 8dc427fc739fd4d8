use meshlink_core::ResourcePeerInfo;
use meshlink_services::testing::{key_of, RecordingResources};

use crate::*;

fn entry(id: &str, port: u16) -> serde_json::Value {
    serde_json::to_value(ResourcePeerInfo {
        client_id: id.to_string(),
        addr: format!("{id}.lan"),
        port,
        key_id: key_of(id),
        node: node(id),
    })
    .unwrap()
}

async fn start_with_resources() -> (Node, RecordingResources) {
    let overlay = Node::start(quiet_config());
    let resources = RecordingResources::new();
    overlay
        .handle
        .set_resource_transfer(Box::new(resources.clone()))
        .await
        .unwrap();
    overlay
        .handle
        .set_local_resource_endpoint("10.0.0.1".into(), 3282)
        .await
        .unwrap();
    (overlay, resources)
}

#[tokio::test]
async fn export_never_contains_local_entry() {
    let (overlay, resources) = start_with_resources().await;
    let (s, _) = overlay.connect_inbound("a").await;

    overlay
        .deliver(
            s,
            PeerMessage::ResourcePeers {
                peers: vec![entry("a", 3282), entry("local", 9), entry("b", 3283)],
            },
        )
        .await;

    let exported = overlay.handle.export_directory().await.unwrap();
    assert_eq!(exported.len(), 2);
    assert!(!exported.contains_key("local"));
    assert_eq!(exported["b"].port, 3283);

    let state = resources.state();
    assert_eq!(state.directories.len(), 1);
    assert!(!state.directories[0].contains_key("local"));
}

#[tokio::test]
async fn wire_answer_carries_local_entry() {
    let (overlay, _) = start_with_resources().await;
    let (s, a) = overlay.connect_inbound("a").await;
    a.take_sent();

    overlay.deliver(s, PeerMessage::GetResourcePeers).await;
    overlay.status().await;

    match &a.sent()[0] {
        PeerMessage::ResourcePeers { peers } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0]["client_id"], "local");
            assert_eq!(peers[0]["port"], 3282);
        }
        other => panic!("unexpected {other:?}"),
    }
    let listed = overlay.handle.resource_peers().await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn put_resource_relayed_out_and_served_in() {
    let (overlay, resources) = start_with_resources().await;
    let (s, a) = overlay.connect_inbound("a").await;
    a.take_sent();

    overlay
        .handle
        .put_resource("blob".into(), "10.0.0.1".into(), 3282, 2)
        .await
        .unwrap();
    overlay.status().await;
    assert_eq!(a.sent_kinds(), vec!["put_resource"]);

    overlay
        .deliver(
            s,
            PeerMessage::PutResource {
                resource: "other".into(),
                address: "a.lan".into(),
                port: 3282,
                copies: 1,
            },
        )
        .await;
    overlay.status().await;

    let state = resources.state();
    assert_eq!(state.puts.len(), 1);
    assert_eq!(state.puts[0].resource, "other");
}

#[tokio::test]
async fn broadcast_asks_every_peer_for_resource_peers() {
    let (overlay, _) = start_with_resources().await;
    let (_, a) = overlay.connect_inbound("a").await;
    let (_, b) = overlay.connect_inbound("b").await;

    overlay.handle.broadcast_get_resource_peers().await.unwrap();
    overlay.status().await;

    assert!(a.sent_kinds().contains(&"get_resource_peers"));
    assert!(b.sent_kinds().contains(&"get_resource_peers"));
}

#[tokio::test]
async fn config_change_forwarded_to_resource_server() {
    let (overlay, resources) = start_with_resources().await;
    overlay.handle.change_config(quiet_config()).await.unwrap();
    overlay.status().await;
    assert_eq!(resources.state().config_changes, 1);
}

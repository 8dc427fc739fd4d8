use std::time::Duration;

use meshlink_core::DisconnectReason;

use crate::*;

fn churn_config(timeout: u64, refresh: u64) -> MeshlinkConfig {
    let mut config = quiet_config();
    config.network.session_timeout_secs = timeout;
    config.network.refresh_interval_secs = refresh;
    config
}

/// Silent for 901 s against a 900 s threshold: disconnected with timeout.
#[tokio::test]
async fn silent_peer_is_timed_out() {
    let overlay = Node::start(churn_config(900, 100_000));
    let (_, p) = overlay.connect_inbound("p").await;
    let (q_session, _) = overlay.connect_inbound("q").await;

    overlay.clock.advance(Duration::from_secs(901));
    overlay.deliver(q_session, PeerMessage::Ping).await;
    let status = overlay.tick().await;

    assert_eq!(p.disconnect_reason(), Some(DisconnectReason::Timeout));
    assert!(status.peers.iter().all(|peer| peer.id != "p"));
    assert_eq!(status.active_peers, 1);
}

#[tokio::test]
async fn silence_at_threshold_is_kept() {
    let overlay = Node::start(churn_config(900, 100_000));
    let (_, p) = overlay.connect_inbound("p").await;

    overlay.clock.advance(Duration::from_secs(900));
    let status = overlay.tick().await;

    assert_eq!(p.disconnect_reason(), None);
    assert_eq!(status.active_peers, 1);
}

#[tokio::test]
async fn refresh_rotates_one_peer() {
    let overlay = Node::start(churn_config(100_000, 60));
    let (_, a) = overlay.connect_inbound("a").await;
    let (_, b) = overlay.connect_inbound("b").await;

    overlay.clock.advance(Duration::from_secs(61));
    let status = overlay.tick().await;

    let refreshed = [a.disconnect_reason(), b.disconnect_reason()]
        .into_iter()
        .filter(|r| *r == Some(DisconnectReason::Refresh))
        .count();
    assert_eq!(refreshed, 1);
    assert_eq!(status.active_peers, 1);

    // The refresh timer restarted, so the next tick leaves the survivor alone.
    let status = overlay.tick().await;
    assert_eq!(status.active_peers, 1);
}

#[tokio::test]
async fn lone_peer_survives_refresh() {
    let overlay = Node::start(churn_config(100_000, 60));
    let (_, a) = overlay.connect_inbound("a").await;

    overlay.clock.advance(Duration::from_secs(61));
    assert_eq!(overlay.tick().await.active_peers, 1);
    assert_eq!(a.disconnect_reason(), None);
}

#[tokio::test]
async fn transport_close_removes_peer_and_advertises_degree() {
    let overlay = Node::start(quiet_config());
    let (a_session, _) = overlay.connect_inbound("a").await;
    let (_, b) = overlay.connect_inbound("b").await;
    assert_eq!(b.degrees().last(), Some(&2));

    overlay.handle.connection_closed(a_session).await.unwrap();
    let status = overlay.status().await;

    assert_eq!(status.active_peers, 1);
    assert_eq!(status.sessions, 1);
    assert_eq!(b.degrees().last(), Some(&1));
}

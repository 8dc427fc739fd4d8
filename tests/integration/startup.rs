use crate::*;

/// Port 70000 is out of range: the seed is flagged and nothing is dialed.
#[tokio::test]
async fn out_of_range_seed_port_is_not_dialed() {
    let mut config = quiet_config();
    config.network.seed_host = "10.1.1.1".into();
    config.network.seed_port = 70_000;
    assert!(config.network.wrong_seed_data());

    let overlay = Node::start(config);
    overlay.status().await;
    assert!(overlay.transport.requests().is_empty());
}

#[tokio::test]
async fn empty_seed_host_is_not_dialed() {
    let overlay = Node::start(quiet_config());
    overlay.status().await;
    assert!(overlay.transport.requests().is_empty());
}

#[tokio::test]
async fn valid_seed_dialed_once_at_startup() {
    let mut config = quiet_config();
    config.network.seed_host = "10.1.1.1".into();
    config.network.seed_port = 40102;

    let overlay = Node::start(config);
    overlay.status().await;

    let requests = overlay.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].hosts[0].to_string(), "10.1.1.1:40102");
    assert_eq!(requests[0].expected, None);
}

#[tokio::test]
async fn config_change_dials_new_seed_and_updates_target() {
    let overlay = Node::start(quiet_config());
    for id in ["c1", "c2", "c3", "c4"] {
        overlay.handle.try_to_add_peer(info(id)).await.unwrap();
    }

    let mut config = quiet_config();
    config.network.seed_host = "seed.lan".into();
    config.network.seed_port = 40102;
    config.network.opt_num_peers = 4;
    overlay.handle.change_config(config).await.unwrap();
    overlay.status().await;

    let seed_dials = overlay.transport.take_requests();
    assert_eq!(seed_dials.len(), 1);
    assert_eq!(seed_dials[0].hosts[0].address, "seed.lan");

    let status = overlay.tick().await;
    assert_eq!(status.target_peers, 4);
    assert_eq!(overlay.transport.requests().len(), 4);
}

#[tokio::test]
async fn config_change_skips_seed_already_connected() {
    let overlay = Node::start(quiet_config());
    let link = MemoryLink::new();
    let session = overlay
        .handle
        .connection_established(link, meshlink_core::HostAddr::new("seed.lan", 5000), true)
        .await
        .unwrap();
    overlay.deliver(session, hello("seed")).await;

    let mut config = quiet_config();
    config.network.seed_host = "seed.lan".into();
    config.network.seed_port = 40102;
    overlay.handle.change_config(config).await.unwrap();
    overlay.status().await;

    assert!(overlay.transport.requests().is_empty());
}

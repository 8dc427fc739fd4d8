//! Gossip and reputation relay.
//!
//! Inbound gossip, stop-gossip notices and neighbour rank observations are
//! buffered here until the ranking collaborator drains them. Each drain
//! hands over the buffer and leaves it empty.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use meshlink_core::{LocalRank, PeerId, PeerMessage};

use crate::service::OverlayService;

/// What `neighbour` told us it thinks of `subject`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeighbourRank {
    pub neighbour: PeerId,
    pub subject: PeerId,
    pub rank: LocalRank,
}

#[derive(Debug, Default)]
pub struct GossipBuffers {
    gossip: Vec<Value>,
    stop_gossip: HashSet<PeerId>,
    neighbour_ranks: Vec<NeighbourRank>,
}

impl GossipBuffers {
    pub fn hear_gossip(&mut self, gossip: Value) {
        self.gossip.push(gossip);
    }

    pub fn drain_gossip(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.gossip)
    }

    pub fn record_stop_gossip(&mut self, peer: PeerId) {
        self.stop_gossip.insert(peer);
    }

    pub fn drain_stop_gossip(&mut self) -> HashSet<PeerId> {
        std::mem::take(&mut self.stop_gossip)
    }

    pub fn record_neighbour_rank(&mut self, rank: NeighbourRank) {
        self.neighbour_ranks.push(rank);
    }

    pub fn drain_neighbour_ranks(&mut self) -> Vec<NeighbourRank> {
        std::mem::take(&mut self.neighbour_ranks)
    }
}

impl OverlayService {
    /// Send `gossip` to each listed peer that is active. Returns how many got it.
    pub fn send_gossip(&self, gossip: &Value, recipients: &[PeerId]) -> usize {
        let mut sent = 0;
        for id in recipients {
            match self.registry.lookup(id) {
                Some(peer) => {
                    peer.send(PeerMessage::Gossip {
                        gossip: gossip.clone(),
                    });
                    sent += 1;
                }
                None => tracing::debug!(peer = %id, "gossip recipient not connected"),
            }
        }
        sent
    }

    pub fn hear_gossip(&mut self, gossip: Value) {
        self.gossip.hear_gossip(gossip);
    }

    pub fn drain_gossip(&mut self) -> Vec<Value> {
        self.gossip.drain_gossip()
    }

    pub fn broadcast_stop_gossip(&self) -> usize {
        self.broadcast(PeerMessage::StopGossip)
    }

    pub fn record_stop_gossip(&mut self, peer: PeerId) {
        self.gossip.record_stop_gossip(peer);
    }

    pub fn drain_stop_gossip(&mut self) -> HashSet<PeerId> {
        self.gossip.drain_stop_gossip()
    }

    /// Share our opinion of `subject` with every active peer.
    pub fn push_local_rank(&self, subject: PeerId, rank: LocalRank) -> usize {
        self.broadcast(PeerMessage::LocRank {
            node_id: subject,
            loc_rank: rank,
        })
    }

    pub fn record_neighbour_rank(&mut self, neighbour: PeerId, subject: PeerId, rank: LocalRank) {
        self.gossip.record_neighbour_rank(NeighbourRank {
            neighbour,
            subject,
            rank,
        });
    }

    pub fn drain_neighbour_ranks(&mut self) -> Vec<NeighbourRank> {
        self.gossip.drain_neighbour_ranks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, Harness};
    use serde_json::json;

    const RANK: LocalRank = LocalRank {
        computing_trust: 0.5,
        requesting_trust: -0.25,
    };

    #[test]
    fn five_gossips_drain_once() {
        let mut buffers = GossipBuffers::default();
        for i in 0..5 {
            buffers.hear_gossip(json!({ "round": i }));
        }
        let drained = buffers.drain_gossip();
        assert_eq!(drained.len(), 5);
        assert_eq!(drained[4], json!({ "round": 4 }));
        assert!(buffers.drain_gossip().is_empty());
    }

    #[test]
    fn stop_gossip_collapses_duplicates() {
        let mut buffers = GossipBuffers::default();
        buffers.record_stop_gossip("a".into());
        buffers.record_stop_gossip("a".into());
        buffers.record_stop_gossip("b".into());
        assert_eq!(buffers.drain_stop_gossip().len(), 2);
        assert!(buffers.drain_stop_gossip().is_empty());
    }

    #[test]
    fn neighbour_ranks_drain_once() {
        let mut buffers = GossipBuffers::default();
        buffers.record_neighbour_rank(NeighbourRank {
            neighbour: "a".into(),
            subject: "x".into(),
            rank: RANK,
        });
        assert_eq!(buffers.drain_neighbour_ranks().len(), 1);
        assert!(buffers.drain_neighbour_ranks().is_empty());
    }

    #[test]
    fn send_gossip_skips_unknown_recipients() {
        let mut h = Harness::new(test_config());
        let (_, a) = h.connect_peer("a");
        let (_, b) = h.connect_peer("b");
        a.take_sent();
        b.take_sent();

        let sent = h
            .service
            .send_gossip(&json!([1, 2]), &["a".to_string(), "nobody".to_string()]);
        assert_eq!(sent, 1);
        assert_eq!(a.sent_kinds(), vec!["gossip"]);
        assert!(b.sent().is_empty());
    }

    #[test]
    fn inbound_relay_messages_land_in_buffers() {
        let mut h = Harness::new(test_config());
        let (sa, _) = h.connect_peer("a");
        h.deliver(sa, PeerMessage::Gossip { gossip: json!("g") });
        h.deliver(sa, PeerMessage::StopGossip);
        h.deliver(
            sa,
            PeerMessage::LocRank {
                node_id: "x".into(),
                loc_rank: RANK,
            },
        );

        assert_eq!(h.service.drain_gossip(), vec![json!("g")]);
        assert!(h.service.drain_stop_gossip().contains("a"));
        let ranks = h.service.drain_neighbour_ranks();
        assert_eq!(ranks[0].neighbour, "a");
        assert_eq!(ranks[0].subject, "x");
    }

    #[test]
    fn broadcasts_reach_every_active_peer() {
        let mut h = Harness::new(test_config());
        let (_, a) = h.connect_peer("a");
        let (_, b) = h.connect_peer("b");
        a.take_sent();
        b.take_sent();

        assert_eq!(h.service.broadcast_stop_gossip(), 2);
        assert_eq!(h.service.push_local_rank("x".into(), RANK), 2);
        assert_eq!(a.sent_kinds(), vec!["stop_gossip", "loc_rank"]);
        assert_eq!(b.sent_kinds(), vec!["stop_gossip", "loc_rank"]);
    }
}

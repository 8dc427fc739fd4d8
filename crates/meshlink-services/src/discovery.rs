//! Discovery: keep the active set at its target and keep the routing table fed.

use std::collections::HashMap;

use serde_json::Value;

use meshlink_core::{DisconnectReason, HostAddr, KeyId, PeerInfo, PeerMessage};

use crate::collaborators::KnownNode;
use crate::registry::PendingCandidate;
use crate::service::OverlayService;

impl OverlayService {
    /// One discovery round: fill the active set, ask for tasks, sync routing.
    pub fn sync_network(&mut self) {
        self.send_get_peers();
        if self.tasks.is_some() {
            self.send_get_tasks();
        }
        self.sync_routing();
    }

    /// Promote at most as many candidates as the active set is short of.
    /// With no candidate left, try one node from the routing table, else ask
    /// the active peers for more (rate limited).
    fn send_get_peers(&mut self) {
        let deficit = self
            .config
            .network
            .opt_num_peers
            .saturating_sub(self.registry.count_active());

        for _ in 0..deficit {
            match self.registry.take_random_free() {
                Some(candidate) => self.connect_to_candidate(&candidate),
                None => {
                    self.candidate_from_routing_table();
                    break;
                }
            }
        }
    }

    fn candidate_from_routing_table(&mut self) {
        match self.routing.random_known_node() {
            Some(known) if self.registry.lookup(&known.id).is_none() => {
                self.try_to_add_peer(PeerInfo {
                    id: known.id,
                    address: known.address,
                    port: known.port,
                    node: known.node,
                });
            }
            _ => {
                let now = self.now();
                if now.saturating_duration_since(self.last_peers_request)
                    > self.config.network.request_interval()
                {
                    self.last_peers_request = now;
                    let asked = self.broadcast(PeerMessage::GetPeers);
                    tracing::debug!(asked, "requested peers");
                }
            }
        }
    }

    fn send_get_tasks(&mut self) {
        let now = self.now();
        if now.saturating_duration_since(self.last_tasks_request)
            > self.config.network.request_interval()
        {
            self.last_tasks_request = now;
            self.broadcast(PeerMessage::GetTasks);
        }
    }

    /// Dial a candidate on every address we know for it, suggested address first.
    fn connect_to_candidate(&mut self, candidate: &PendingCandidate) {
        let mut hosts = candidate.node.host_candidates(candidate.port);
        let reported = HostAddr::new(candidate.address.clone(), candidate.port);
        if !hosts.contains(&reported) {
            hosts.push(reported);
        }
        if let Some(addr) = self.suggested_addrs.get(&candidate.node.key) {
            let suggested = HostAddr::new(addr.clone(), candidate.port);
            hosts.retain(|h| *h != suggested);
            hosts.insert(0, suggested);
        }
        tracing::info!(
            peer = %candidate.id,
            attempt = candidate.attempts,
            hosts = hosts.len(),
            "connecting to peer"
        );
        self.transport.connect_to_host(hosts, Some(candidate.id.clone()));
    }

    /// Queue a peer we just heard of. Known, active and local ids are ignored.
    pub fn try_to_add_peer(&mut self, info: PeerInfo) -> bool {
        if !self.registry.is_new_peer(&info.id, &self.node.node_id) {
            return false;
        }
        tracing::info!(peer = %info.id, address = %info.address, port = info.port, "add peer to candidates");
        self.registry.add_candidate(PendingCandidate {
            id: info.id,
            address: info.address,
            port: info.port,
            node: info.node,
            attempts: 0,
        });
        true
    }

    /// Feed a peers list from the wire. Bad entries are skipped.
    pub(crate) fn add_peers_from_list(&mut self, peers: Vec<Value>) {
        for entry in peers {
            match serde_json::from_value::<PeerInfo>(entry) {
                Ok(info) => {
                    self.try_to_add_peer(info);
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed peer entry"),
            }
        }
    }

    fn sync_routing(&mut self) {
        self.end_expired_sessions();
        let lookups = self.routing.sync_network();
        self.end_expired_sessions();
        if !lookups.is_empty() {
            self.send_find_nodes(lookups);
        }
    }

    fn end_expired_sessions(&mut self) {
        for peer in self.routing.sessions_to_end() {
            if let Some(handle) = self.registry.lookup(&peer) {
                handle.disconnect(DisconnectReason::Timeout);
            }
            self.unregister_by_id(&peer);
        }
        self.routing.clear_sessions_to_end();
    }

    /// Ask every active neighbour of each target to look it up.
    pub fn send_find_nodes(&self, lookups: HashMap<KeyId, Vec<KnownNode>>) {
        for (target, neighbours) in lookups {
            for neighbour in neighbours {
                if let Some(peer) = self.registry.lookup(&neighbour.id) {
                    peer.send(PeerMessage::FindNode {
                        key_id: target.clone(),
                    });
                }
            }
        }
    }

    /// Nodes the routing table considers closest to `key_id`.
    pub fn find_node(&self, key_id: &KeyId) -> Vec<PeerInfo> {
        self.routing
            .neighbours(key_id)
            .into_iter()
            .map(|n| PeerInfo {
                id: n.id,
                address: n.address,
                port: n.port,
                node: n.node,
            })
            .collect()
    }
}

//! Inbound message dispatch.
//!
//! Every message refreshes the session's liveness and lands in the recent
//! message ring before it is routed to its handler.

use meshlink_core::message::PROTOCOL_VERSION;
use meshlink_core::{DisconnectReason, KeyId, NodeDescriptor, PeerId, PeerMessage};

use crate::registry::SessionId;
use crate::service::OverlayService;

impl OverlayService {
    pub fn handle_message(&mut self, session: SessionId, message: PeerMessage) {
        if self.registry.session(session).is_none() {
            tracing::debug!(session = %session, kind = message.kind(), "message for closed session");
            return;
        }
        self.record_last_message(session, message.kind());

        match message {
            PeerMessage::Hello {
                port,
                client_id,
                key_id,
                node,
                proto_version,
            } => self.react_to_hello(session, port, client_id, key_id, node, proto_version),
            PeerMessage::Ping => self.reply(session, PeerMessage::Pong),
            PeerMessage::Pong => self.react_to_pong(session),
            PeerMessage::Disconnect { reason } => {
                tracing::info!(session = %session, reason = ?reason, "peer disconnected");
                self.unregister(session);
            }
            PeerMessage::GetPeers => {
                let asking = self.peer_id(session);
                let peers = self
                    .registry
                    .active_peers()
                    .filter(|p| p.id != asking)
                    .filter_map(|p| p.info())
                    .filter_map(|info| serde_json::to_value(info).ok())
                    .collect();
                self.reply(session, PeerMessage::Peers { peers });
            }
            PeerMessage::Peers { peers } => self.add_peers_from_list(peers),
            PeerMessage::GetTasks => {
                if let Some(tasks) = self.tasks_message() {
                    self.reply(session, tasks);
                }
            }
            PeerMessage::Tasks { headers } => self.add_task_headers_from_list(headers),
            PeerMessage::RemoveTask { task_id } => self.remove_task_header(&task_id),
            PeerMessage::FindNode { key_id } => {
                let peers = self
                    .find_node(&key_id)
                    .into_iter()
                    .filter_map(|info| serde_json::to_value(info).ok())
                    .collect();
                self.reply(session, PeerMessage::Peers { peers });
            }
            PeerMessage::GetResourcePeers => {
                let answer = self.resource_peers_message();
                self.reply(session, answer);
            }
            PeerMessage::ResourcePeers { peers } => self.merge_remote_entries(peers),
            PeerMessage::PutResource {
                resource,
                address,
                port,
                copies,
            } => self.put_resource(resource, address, port, copies),
            PeerMessage::WantToStartTaskSession {
                node,
                conn_id,
                super_node,
            } => self.peer_want_task_session(node, super_node, conn_id),
            PeerMessage::SetTaskSession {
                key_id,
                node,
                conn_id,
                super_node,
            } => {
                self.peer_want_to_set_task_session(key_id, node, conn_id, super_node);
            }
            PeerMessage::Gossip { gossip } => self.hear_gossip(gossip),
            PeerMessage::StopGossip => match self.peer_id(session) {
                Some(peer) => self.record_stop_gossip(peer),
                None => tracing::debug!(session = %session, "stop-gossip before hello"),
            },
            PeerMessage::LocRank { node_id, loc_rank } => match self.peer_id(session) {
                Some(peer) => self.record_neighbour_rank(peer, node_id, loc_rank),
                None => tracing::debug!(session = %session, "loc-rank before hello"),
            },
            PeerMessage::Degree { degree } => {
                if let Some(handle) = self.registry.session_mut(session) {
                    handle.degree = degree;
                }
            }
        }
    }

    fn reply(&self, session: SessionId, message: PeerMessage) {
        if let Some(handle) = self.registry.session(session) {
            handle.send(message);
        }
    }

    fn peer_id(&self, session: SessionId) -> Option<PeerId> {
        self.registry.session(session)?.id.clone()
    }

    fn react_to_hello(
        &mut self,
        session: SessionId,
        port: u16,
        client_id: PeerId,
        key_id: KeyId,
        node: NodeDescriptor,
        proto_version: u32,
    ) {
        if proto_version != PROTOCOL_VERSION {
            tracing::warn!(peer = %client_id, proto_version, "unsupported protocol version");
            self.disconnect_session(session, DisconnectReason::BadProtocol);
            return;
        }
        if key_id == self.node.key || client_id == self.node.node_id {
            self.disconnect_session(session, DisconnectReason::SelfConnection);
            return;
        }

        if self.peer_id(session).is_some_and(|id| id != client_id) {
            tracing::warn!(session = %session, peer = %client_id, "hello changes peer id");
            self.disconnect_session(session, DisconnectReason::BadProtocol);
            return;
        }

        let address = match self.registry.session_mut(session) {
            Some(handle) => {
                handle.id = Some(client_id.clone());
                handle.key_id = Some(key_id.clone());
                handle.port = port;
                handle.node = Some(node.clone());
                handle.address.clone()
            }
            None => return,
        };

        match self.registry.active_session_id(&client_id) {
            Some(existing) if existing != session => {
                self.disconnect_session(session, DisconnectReason::DuplicatePeers);
                return;
            }
            Some(_) => return,
            None => {}
        }

        if let Err(err) = self.register(client_id.clone(), session) {
            tracing::warn!(peer = %client_id, error = %err, "can't register peer");
            return;
        }
        tracing::info!(peer = %client_id, address = %address, port, "peer registered");
        if let Some(stale) = self.routing.add_peer(&key_id, &client_id, &address, port, &node) {
            if let Some(peer) = self.registry.lookup(&stale.id) {
                peer.send(PeerMessage::Ping);
            }
        }
        self.set_suggested_addr(key_id, address);
    }

    fn react_to_pong(&mut self, session: SessionId) {
        let Some(handle) = self.registry.session(session) else {
            return;
        };
        if let (Some(id), Some(key)) = (handle.id.clone(), handle.key_id.clone()) {
            let address = handle.address.clone();
            let port = handle.port;
            self.routing.pong_received(&key, &id, &address, port);
        }
    }
}

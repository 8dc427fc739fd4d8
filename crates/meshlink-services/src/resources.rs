//! Resource directory: which nodes serve resources, and where.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use meshlink_core::{KeyId, NodeDescriptor, PeerId, PeerMessage, ResourcePeerInfo};

use crate::service::OverlayService;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEndpoint {
    pub address: String,
    pub port: u16,
    pub key_id: KeyId,
    pub node: NodeDescriptor,
}

/// Node id -> resource endpoint. May hold the local node's own entry,
/// which never leaves through [`ResourceDirectory::export`].
#[derive(Debug)]
pub struct ResourceDirectory {
    local_id: PeerId,
    entries: HashMap<PeerId, ResourceEndpoint>,
}

impl ResourceDirectory {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            entries: HashMap::new(),
        }
    }

    pub fn set_local(&mut self, endpoint: ResourceEndpoint) {
        self.entries.insert(self.local_id.clone(), endpoint);
    }

    pub fn local(&self) -> Option<&ResourceEndpoint> {
        self.entries.get(&self.local_id)
    }

    /// Merge wire entries. Entries for the local id and malformed entries are skipped.
    pub fn merge(&mut self, entries: Vec<Value>) -> usize {
        let mut merged = 0;
        for entry in entries {
            let peer: ResourcePeerInfo = match serde_json::from_value(entry) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed resource peer entry");
                    continue;
                }
            };
            if peer.client_id == self.local_id {
                continue;
            }
            self.entries.insert(
                peer.client_id,
                ResourceEndpoint {
                    address: peer.addr,
                    port: peer.port,
                    key_id: peer.key_id,
                    node: peer.node,
                },
            );
            merged += 1;
        }
        merged
    }

    /// Copy of the directory without the local entry.
    pub fn export(&self) -> HashMap<PeerId, ResourceEndpoint> {
        self.entries
            .iter()
            .filter(|(id, _)| **id != self.local_id)
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    /// Every entry, local included, as sent in a resource-peers reply.
    pub fn wire_entries(&self) -> Vec<ResourcePeerInfo> {
        self.entries
            .iter()
            .map(|(id, e)| ResourcePeerInfo {
                client_id: id.clone(),
                addr: e.address.clone(),
                port: e.port,
                key_id: e.key_id.clone(),
                node: e.node.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OverlayService {
    /// Advertise the local resource server.
    pub fn set_local_resource_endpoint(&mut self, address: String, port: u16) {
        self.config.resources.resource_port = port;
        self.directory.set_local(ResourceEndpoint {
            address,
            port,
            key_id: self.node.key.clone(),
            node: self.node.clone(),
        });
    }

    /// Merge entries from a peer and hand the result to the resource server.
    pub fn merge_remote_entries(&mut self, entries: Vec<Value>) {
        let merged = self.directory.merge(entries);
        tracing::debug!(merged, total = self.directory.len(), "resource peers merged");
        match self.resource_transfer.as_mut() {
            Some(transfer) => transfer.set_resource_peers(self.directory.export()),
            None => tracing::debug!("no resource server attached"),
        }
    }

    pub fn export_directory(&self) -> HashMap<PeerId, ResourceEndpoint> {
        self.directory.export()
    }

    /// Directory as answered to a get-resource-peers request.
    pub fn get_resource_peers(&self) -> Vec<ResourcePeerInfo> {
        self.directory.wire_entries()
    }

    pub(crate) fn resource_peers_message(&self) -> PeerMessage {
        let peers = self
            .get_resource_peers()
            .into_iter()
            .filter_map(|p| serde_json::to_value(p).ok())
            .collect();
        PeerMessage::ResourcePeers { peers }
    }

    pub fn broadcast_get_resource_peers(&self) -> usize {
        self.broadcast(PeerMessage::GetResourcePeers)
    }

    /// Hand a put-resource request to one active peer. False with no peers.
    pub fn relay_put_resource(&self, resource: String, address: String, port: u16, copies: u32) -> bool {
        let Some(peer) = self.registry.active_peers().next() else {
            tracing::debug!("no peers to relay put-resource to");
            return false;
        };
        peer.send(PeerMessage::PutResource {
            resource,
            address,
            port,
            copies,
        });
        true
    }

    /// A peer asked us to store a resource.
    pub fn put_resource(&mut self, resource: String, address: String, port: u16, copies: u32) {
        match self.resource_transfer.as_mut() {
            Some(transfer) => transfer.put_resource(resource, address, port, copies),
            None => tracing::warn!(resource = %resource, "put-resource without a resource server"),
        }
    }
}

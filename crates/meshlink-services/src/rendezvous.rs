//! Task-session rendezvous.
//!
//! A node that wants a task session with some key either reaches the owner
//! directly or asks every other peer to pass the request on. Delegated
//! requests are remembered by connection id so each one is relayed once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meshlink_core::{KeyId, NodeDescriptor, PeerId, PeerMessage};

use crate::service::OverlayService;

#[derive(Debug, Clone, PartialEq)]
pub struct RendezvousRecord {
    pub key_id: KeyId,
    pub node: NodeDescriptor,
    pub created_at: Instant,
}

#[derive(Debug)]
pub struct RendezvousTable {
    records: HashMap<String, RendezvousRecord>,
    ttl: Duration,
}

impl RendezvousTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: HashMap::new(),
            ttl,
        }
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.records.contains_key(conn_id)
    }

    /// Returns false if `conn_id` is already recorded.
    pub fn record(&mut self, conn_id: String, record: RendezvousRecord) -> bool {
        if self.records.contains_key(&conn_id) {
            return false;
        }
        self.records.insert(conn_id, record);
        true
    }

    /// Drop records older than the TTL. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        let ttl = self.ttl;
        self.records
            .retain(|_, r| now.saturating_duration_since(r.created_at) <= ttl);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Where a start-session request went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousRoute {
    /// Sent to the peer owning the key.
    Direct(PeerId),
    /// Delegated to this many peers.
    Broadcast(usize),
    /// Connection id already handled.
    Duplicate,
}

impl OverlayService {
    /// Route a request from `node` to open a task session with `key_id`.
    pub fn want_to_start_task_session(
        &self,
        key_id: &KeyId,
        node: NodeDescriptor,
        conn_id: String,
        super_node: Option<NodeDescriptor>,
    ) -> RendezvousRoute {
        if let Some(peer) = self
            .registry
            .active_peers()
            .find(|p| p.key_id.as_ref() == Some(key_id))
        {
            tracing::debug!(key = %key_id, conn_id = %conn_id, "start task session sent to owner");
            peer.send(PeerMessage::WantToStartTaskSession {
                node,
                conn_id,
                super_node,
            });
            return RendezvousRoute::Direct(peer.id.clone().unwrap_or_default());
        }

        let mut sent = 0;
        for peer in self.registry.active_peers() {
            if peer.key_id.as_ref() == Some(&node.key) {
                continue;
            }
            peer.send(PeerMessage::SetTaskSession {
                key_id: key_id.clone(),
                node: node.clone(),
                conn_id: conn_id.clone(),
                super_node: super_node.clone(),
            });
            sent += 1;
        }
        tracing::debug!(key = %key_id, conn_id = %conn_id, sent, "owner unknown, delegated task session");
        RendezvousRoute::Broadcast(sent)
    }

    /// A peer relayed a start-session request. Each connection id is handled once.
    pub fn peer_want_to_set_task_session(
        &mut self,
        key_id: KeyId,
        node: NodeDescriptor,
        conn_id: String,
        super_node: Option<NodeDescriptor>,
    ) -> RendezvousRoute {
        if self.rendezvous.contains(&conn_id) {
            return RendezvousRoute::Duplicate;
        }
        let super_node = match super_node {
            None if self.node.is_super_node() => Some(self.node.clone()),
            other => other,
        };
        let now = self.now();
        self.rendezvous.record(
            conn_id.clone(),
            RendezvousRecord {
                key_id: key_id.clone(),
                node: node.clone(),
                created_at: now,
            },
        );
        self.want_to_start_task_session(&key_id, node, conn_id, super_node)
    }

    /// The request reached the owner: hand it to the task coordinator.
    pub(crate) fn peer_want_task_session(
        &mut self,
        node: NodeDescriptor,
        super_node: Option<NodeDescriptor>,
        conn_id: String,
    ) {
        match self.tasks.as_mut() {
            Some(tasks) => tasks.start_task_session(node, super_node, conn_id),
            None => tracing::warn!(conn_id = %conn_id, "task session requested without a task coordinator"),
        }
    }

    pub fn sweep_rendezvous(&mut self) -> usize {
        let now = self.now();
        let expired = self.rendezvous.sweep(now);
        if expired > 0 {
            tracing::debug!(expired, "rendezvous records expired");
        }
        expired
    }
}

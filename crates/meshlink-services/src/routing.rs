//! Flat routing table: one bounded bucket, XOR distance over hashed keys.
//!
//! When full, a newcomer waits while the least recently seen node is pinged.
//! If that node answers the newcomer is dropped, otherwise it takes the slot
//! and the stale node's session is flagged for closing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use meshlink_core::crypto::hash;
use meshlink_core::{KeyId, NodeDescriptor, PeerId};

use crate::collaborators::{Clock, KnownNode, RoutingTable};

pub const DEFAULT_CAPACITY: usize = 64;

/// Nodes returned per neighbour query.
pub const NEIGHBOURS: usize = 8;

const PING_TIMEOUT: Duration = Duration::from_secs(10);
const LOOKUP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    node: KnownNode,
    last_seen: Instant,
}

struct Replacement {
    stale: KeyId,
    newcomer: KnownNode,
    pinged_at: Instant,
}

pub struct FlatRoutingTable {
    local_key: KeyId,
    capacity: usize,
    nodes: HashMap<KeyId, Entry>,
    replacement: Option<Replacement>,
    sessions_to_end: Vec<PeerId>,
    last_lookup: Option<Instant>,
    clock: Arc<dyn Clock>,
}

impl FlatRoutingTable {
    pub fn new(local_key: KeyId, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(local_key, DEFAULT_CAPACITY, clock)
    }

    pub fn with_capacity(local_key: KeyId, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            local_key,
            capacity: capacity.max(1),
            nodes: HashMap::new(),
            replacement: None,
            sessions_to_end: Vec::new(),
            last_lookup: None,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.nodes.contains_key(key_id)
    }

    fn insert(&mut self, node: KnownNode) -> Option<KnownNode> {
        let now = self.clock.now();
        if node.key_id == self.local_key {
            return None;
        }
        if let Some(entry) = self.nodes.get_mut(&node.key_id) {
            entry.node = node;
            entry.last_seen = now;
            return None;
        }
        if self.nodes.len() < self.capacity {
            self.nodes.insert(node.key_id.clone(), Entry { node, last_seen: now });
            return None;
        }
        if self.replacement.is_some() {
            return None;
        }

        let stale = self.nodes.values().min_by_key(|e| e.last_seen)?.node.clone();
        self.replacement = Some(Replacement {
            stale: stale.key_id.clone(),
            newcomer: node,
            pinged_at: now,
        });
        Some(stale)
    }

    fn expire_and_lookup(&mut self) -> HashMap<KeyId, Vec<KnownNode>> {
        let now = self.clock.now();
        let expired = self
            .replacement
            .as_ref()
            .is_some_and(|r| now.saturating_duration_since(r.pinged_at) > PING_TIMEOUT);
        if expired {
            if let Some(r) = self.replacement.take() {
                if let Some(old) = self.nodes.remove(&r.stale) {
                    tracing::debug!(peer = %old.node.id, "routing entry replaced");
                    self.sessions_to_end.push(old.node.id);
                }
                self.nodes.insert(
                    r.newcomer.key_id.clone(),
                    Entry {
                        node: r.newcomer,
                        last_seen: now,
                    },
                );
            }
        }

        let due = self
            .last_lookup
            .map_or(true, |t| now.saturating_duration_since(t) > LOOKUP_INTERVAL);
        let mut lookups = HashMap::new();
        if due && !self.nodes.is_empty() {
            self.last_lookup = Some(now);
            let target = self.local_key.clone();
            lookups.insert(target.clone(), self.neighbours(&target));
        }
        lookups
    }
}

fn distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

impl RoutingTable for FlatRoutingTable {
    fn add_peer(
        &mut self,
        key_id: &KeyId,
        id: &PeerId,
        address: &str,
        port: u16,
        node: &NodeDescriptor,
    ) -> Option<KnownNode> {
        self.insert(KnownNode {
            id: id.clone(),
            key_id: key_id.clone(),
            address: address.to_string(),
            port,
            node: node.clone(),
        })
    }

    fn pong_received(&mut self, key_id: &KeyId, _id: &PeerId, _address: &str, _port: u16) {
        if self.replacement.as_ref().is_some_and(|r| r.stale == *key_id) {
            self.replacement = None;
        }
        self.touch(key_id);
    }

    fn touch(&mut self, key_id: &KeyId) {
        if let Some(entry) = self.nodes.get_mut(key_id) {
            entry.last_seen = self.clock.now();
        }
    }

    fn neighbours(&self, key_id: &KeyId) -> Vec<KnownNode> {
        let target = hash(key_id.as_bytes());
        let mut nodes: Vec<(&KnownNode, [u8; 32])> = self
            .nodes
            .values()
            .filter(|e| e.node.key_id != *key_id)
            .map(|e| (&e.node, distance(&target, &hash(e.node.key_id.as_bytes()))))
            .collect();
        nodes.sort_by(|a, b| a.1.cmp(&b.1));
        nodes
            .into_iter()
            .take(NEIGHBOURS)
            .map(|(n, _)| n.clone())
            .collect()
    }

    fn random_known_node(&mut self) -> Option<KnownNode> {
        self.nodes
            .values()
            .choose(&mut rand::thread_rng())
            .map(|e| e.node.clone())
    }

    fn sync_network(&mut self) -> HashMap<KeyId, Vec<KnownNode>> {
        self.expire_and_lookup()
    }

    fn sessions_to_end(&self) -> Vec<PeerId> {
        self.sessions_to_end.clone()
    }

    fn clear_sessions_to_end(&mut self) {
        self.sessions_to_end.clear();
    }
}

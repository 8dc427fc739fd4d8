//! Peer registry: established sessions, the active subset keyed by peer id,
//! and peers we have heard of but not connected to yet.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use meshlink_core::{DisconnectReason, HostAddr, KeyId, NodeDescriptor, PeerId, PeerInfo, PeerMessage};

use crate::collaborators::PeerLink;
use crate::error::OverlayError;

/// Local handle for one transport session. Assigned in establishment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A live session to a remote node. Identity fields stay empty until its hello arrives.
pub struct PeerHandle {
    pub session_id: SessionId,
    pub id: Option<PeerId>,
    pub key_id: Option<KeyId>,
    pub address: String,
    /// Remote socket port until hello, the peer's listen port after.
    pub port: u16,
    pub node: Option<NodeDescriptor>,
    /// Active-peer count the remote last advertised.
    pub degree: usize,
    pub last_message_at: Instant,
    pub established_at: Instant,
    pub last_ping_at: Option<Instant>,
    pub outbound: bool,
    link: Arc<dyn PeerLink>,
}

impl PeerHandle {
    pub fn send(&self, message: PeerMessage) {
        self.link.send(message);
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        self.link.disconnect(reason);
    }

    /// Entry for a peers list. `None` before hello.
    pub fn info(&self) -> Option<PeerInfo> {
        Some(PeerInfo {
            id: self.id.clone()?,
            address: self.address.clone(),
            port: self.port,
            node: self.node.clone()?,
        })
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("session_id", &self.session_id)
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("degree", &self.degree)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// A peer learned from a peers list or the routing table, not yet connected.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCandidate {
    pub id: PeerId,
    pub address: String,
    pub port: u16,
    pub node: NodeDescriptor,
    pub attempts: u32,
}

#[derive(Default)]
pub struct PeerRegistry {
    /// Every established session, active or not.
    sessions: BTreeMap<SessionId, PeerHandle>,
    /// Peer id -> session. Every value is a key of `sessions`.
    active: HashMap<PeerId, SessionId>,
    /// Every candidate ever learned. Never re-added once known.
    candidates: HashMap<PeerId, PendingCandidate>,
    /// Candidates waiting for an outbound attempt.
    free: Vec<PeerId>,
    next_session: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Add a freshly established session. It is not active until registered.
    pub fn insert_session(
        &mut self,
        link: Arc<dyn PeerLink>,
        remote: HostAddr,
        outbound: bool,
        now: Instant,
    ) -> SessionId {
        self.next_session += 1;
        let session_id = SessionId(self.next_session);
        self.sessions.insert(
            session_id,
            PeerHandle {
                session_id,
                id: None,
                key_id: None,
                address: remote.address,
                port: remote.port,
                node: None,
                degree: 0,
                last_message_at: now,
                established_at: now,
                last_ping_at: None,
                outbound,
                link,
            },
        );
        session_id
    }

    pub fn session(&self, session: SessionId) -> Option<&PeerHandle> {
        self.sessions.get(&session)
    }

    pub fn session_mut(&mut self, session: SessionId) -> Option<&mut PeerHandle> {
        self.sessions.get_mut(&session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerHandle> {
        self.sessions.values()
    }

    pub fn count_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Make `session` the active session for `peer`.
    ///
    /// A different session already active for `peer` leaves the registry and is
    /// handed back for the caller to close. A session is active under one id only,
    /// so any other id it was registered under is dropped.
    pub fn register(
        &mut self,
        peer: PeerId,
        session: SessionId,
    ) -> Result<Option<PeerHandle>, OverlayError> {
        if !self.sessions.contains_key(&session) {
            return Err(OverlayError::UnknownSession(session));
        }
        self.free.retain(|id| *id != peer);
        self.active.retain(|id, s| *s != session || *id == peer);
        match self.active.insert(peer, session) {
            Some(displaced) if displaced != session => Ok(self.sessions.remove(&displaced)),
            _ => Ok(None),
        }
    }

    /// Drop a session from both collections.
    pub fn remove_session(&mut self, session: SessionId) -> Option<PeerHandle> {
        let handle = self.sessions.remove(&session)?;
        self.active.retain(|_, s| *s != session);
        Some(handle)
    }

    /// Drop the active session of `peer` from both collections.
    pub fn remove_by_id(&mut self, peer: &str) -> Option<PeerHandle> {
        let session = self.active.remove(peer)?;
        self.remove_session(session)
    }

    // ── Active peers ─────────────────────────────────────────────────────────

    pub fn lookup(&self, peer: &str) -> Option<&PeerHandle> {
        self.active.get(peer).and_then(|s| self.sessions.get(s))
    }

    pub fn lookup_mut(&mut self, peer: &str) -> Option<&mut PeerHandle> {
        let session = *self.active.get(peer)?;
        self.sessions.get_mut(&session)
    }

    pub fn active_session_id(&self, peer: &str) -> Option<SessionId> {
        self.active.get(peer).copied()
    }

    pub fn is_active_session(&self, session: SessionId) -> bool {
        self.active.values().any(|s| *s == session)
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &PeerHandle> {
        self.active.values().filter_map(|s| self.sessions.get(s))
    }

    pub fn active_ids(&self) -> Vec<PeerId> {
        self.active.keys().cloned().collect()
    }

    pub fn count_active(&self) -> usize {
        self.active.len()
    }

    pub fn has_enough(&self, target: usize) -> bool {
        self.count_active() >= target
    }

    // ── Candidates ───────────────────────────────────────────────────────────

    /// Unknown as a candidate, not active and not ourselves.
    pub fn is_new_peer(&self, peer: &str, local_id: &str) -> bool {
        !self.candidates.contains_key(peer) && !self.active.contains_key(peer) && peer != local_id
    }

    /// Queue a candidate for an outbound attempt. Caller checks `is_new_peer` first.
    pub fn add_candidate(&mut self, candidate: PendingCandidate) {
        self.free.push(candidate.id.clone());
        self.candidates.insert(candidate.id.clone(), candidate);
    }

    pub fn candidate(&self, peer: &str) -> Option<&PendingCandidate> {
        self.candidates.get(peer)
    }

    pub fn count_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn count_free(&self) -> usize {
        self.free.len()
    }

    /// Pull a uniformly random candidate off the free queue and count the attempt.
    pub fn take_random_free(&mut self) -> Option<PendingCandidate> {
        if self.free.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.free.len());
        let peer = self.free.swap_remove(index);
        let candidate = self.candidates.get_mut(&peer)?;
        candidate.attempts += 1;
        Some(candidate.clone())
    }

    /// Put a candidate back on the free queue after a failed attempt.
    /// Returns false once it has used up `max_attempts` or is already active.
    pub fn requeue_failed(&mut self, peer: &str, max_attempts: u32) -> bool {
        if self.active.contains_key(peer) || self.free.iter().any(|id| id == peer) {
            return false;
        }
        match self.candidates.get(peer) {
            Some(candidate) if candidate.attempts < max_attempts => {
                self.free.push(peer.to_string());
                true
            }
            _ => false,
        }
    }

    /// Every active entry points at a distinct live session.
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::new();
        self.active
            .values()
            .all(|s| self.sessions.contains_key(s) && seen.insert(*s))
            && self.free.iter().all(|id| self.candidates.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryLink;

    fn addr(port: u16) -> HostAddr {
        HostAddr::new("10.0.0.1", port)
    }

    fn candidate(id: &str) -> PendingCandidate {
        PendingCandidate {
            id: id.to_string(),
            address: "10.0.0.9".to_string(),
            port: 40102,
            node: NodeDescriptor::default(),
            attempts: 0,
        }
    }

    #[test]
    fn new_session_is_not_active() {
        let mut registry = PeerRegistry::new();
        let s = registry.insert_session(MemoryLink::shared(), addr(1), false, Instant::now());
        assert_eq!(registry.count_sessions(), 1);
        assert_eq!(registry.count_active(), 0);
        assert!(registry.session(s).is_some());
        assert!(registry.is_consistent());
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = PeerRegistry::new();
        let s = registry.insert_session(MemoryLink::shared(), addr(1), true, Instant::now());
        assert!(registry.register("a".into(), s).unwrap().is_none());
        assert_eq!(registry.lookup("a").map(|p| p.session_id), Some(s));
        assert!(registry.has_enough(1));
        assert!(!registry.has_enough(2));
    }

    #[test]
    fn register_unknown_session_is_refused() {
        let mut registry = PeerRegistry::new();
        assert!(matches!(
            registry.register("a".into(), SessionId(42)),
            Err(OverlayError::UnknownSession(SessionId(42)))
        ));
        assert_eq!(registry.count_active(), 0);
    }

    #[test]
    fn register_hands_back_displaced_session() {
        let mut registry = PeerRegistry::new();
        let s1 = registry.insert_session(MemoryLink::shared(), addr(1), true, Instant::now());
        let s2 = registry.insert_session(MemoryLink::shared(), addr(2), false, Instant::now());
        assert!(registry.register("a".into(), s1).unwrap().is_none());
        let displaced = registry.register("a".into(), s2).unwrap();

        assert_eq!(displaced.map(|p| p.session_id), Some(s1));
        assert_eq!(registry.count_active(), 1);
        assert_eq!(registry.active_session_id("a"), Some(s2));
        assert_eq!(registry.count_sessions(), 1);
        assert!(registry.session(s1).is_none());
        assert!(registry.is_consistent());
    }

    #[test]
    fn reregistering_same_session_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let s = registry.insert_session(MemoryLink::shared(), addr(1), true, Instant::now());
        registry.register("a".into(), s).unwrap();
        assert!(registry.register("a".into(), s).unwrap().is_none());
        assert_eq!(registry.count_sessions(), 1);
        assert_eq!(registry.count_active(), 1);
    }

    #[test]
    fn session_active_under_one_id_only() {
        let mut registry = PeerRegistry::new();
        let s = registry.insert_session(MemoryLink::shared(), addr(1), true, Instant::now());
        registry.register("a".into(), s).unwrap();
        registry.register("b".into(), s).unwrap();

        assert_eq!(registry.count_active(), 1);
        assert!(registry.lookup("a").is_none());
        assert_eq!(registry.active_session_id("b"), Some(s));
        assert!(registry.is_consistent());
    }

    #[test]
    fn remove_session_clears_active_entry() {
        let mut registry = PeerRegistry::new();
        let s = registry.insert_session(MemoryLink::shared(), addr(1), true, Instant::now());
        registry.register("a".into(), s).unwrap();
        assert!(registry.remove_session(s).is_some());
        assert!(registry.lookup("a").is_none());
        assert_eq!(registry.count_sessions(), 0);
        assert!(registry.is_consistent());
    }

    #[test]
    fn remove_unknown_id_is_noop() {
        let mut registry = PeerRegistry::new();
        assert!(registry.remove_by_id("ghost").is_none());
    }

    #[test]
    fn subset_holds_over_mixed_operations() {
        let mut registry = PeerRegistry::new();
        let now = Instant::now();
        let mut ids = Vec::new();
        for i in 0..10u16 {
            ids.push(registry.insert_session(MemoryLink::shared(), addr(i), i % 2 == 0, now));
        }
        for (i, s) in ids.iter().enumerate() {
            registry.register(format!("p{}", i % 4), *s).unwrap();
            assert!(registry.is_consistent());
        }
        registry.remove_session(ids[3]);
        registry.remove_by_id("p1");
        registry.remove_session(ids[9]);
        assert!(registry.is_consistent());
        assert_eq!(registry.count_active(), registry.active_ids().len());
    }

    #[test]
    fn candidates_are_never_readded() {
        let mut registry = PeerRegistry::new();
        assert!(registry.is_new_peer("c1", "me"));
        registry.add_candidate(candidate("c1"));
        assert!(!registry.is_new_peer("c1", "me"));
        assert!(!registry.is_new_peer("me", "me"));

        let taken = registry.take_random_free().unwrap();
        assert_eq!(taken.attempts, 1);
        assert_eq!(registry.count_free(), 0);
        assert!(!registry.is_new_peer("c1", "me"));
    }

    #[test]
    fn failed_candidate_requeued_until_max_attempts() {
        let mut registry = PeerRegistry::new();
        registry.add_candidate(candidate("c1"));

        registry.take_random_free();
        assert!(registry.requeue_failed("c1", 2));
        assert!(!registry.requeue_failed("c1", 2), "already queued");

        registry.take_random_free();
        assert_eq!(registry.candidate("c1").unwrap().attempts, 2);
        assert!(!registry.requeue_failed("c1", 2));
        assert_eq!(registry.count_free(), 0);
    }

    #[test]
    fn registering_drops_candidate_from_free_queue() {
        let mut registry = PeerRegistry::new();
        registry.add_candidate(candidate("c1"));
        let s = registry.insert_session(MemoryLink::shared(), addr(1), false, Instant::now());
        registry.register("c1".into(), s).unwrap();
        assert_eq!(registry.count_free(), 0);
        assert!(registry.take_random_free().is_none());
    }
}

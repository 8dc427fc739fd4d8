//! Seams between the control plane and the systems it drives.
//!
//! The overlay never opens sockets, walks routing buckets, schedules tasks
//! or moves resource bytes itself. It calls these traits and receives their
//! results back as commands on the owner queue.

use std::collections::HashMap;
use std::time::Instant;

use meshlink_core::config::MeshlinkConfig;
use meshlink_core::{DisconnectReason, HostAddr, KeyId, NodeDescriptor, PeerId, PeerMessage, TaskHeader};

use crate::resources::ResourceEndpoint;

/// Opens outbound connections. Results come back asynchronously as
/// `ConnectionEstablished` / `ConnectionFailed` commands.
pub trait Transport: Send + Sync {
    /// Dial one address. `expected` names the peer we think lives there.
    fn connect(&self, addr: HostAddr, expected: Option<PeerId>);

    /// Dial the first reachable address of `hosts`, in order.
    fn connect_to_host(&self, hosts: Vec<HostAddr>, expected: Option<PeerId>);
}

/// Outbound half of one established session. Must not block.
pub trait PeerLink: Send + Sync {
    fn send(&self, message: PeerMessage);

    /// Tell the remote why, then close.
    fn disconnect(&self, reason: DisconnectReason);
}

/// A node the routing table knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownNode {
    pub id: PeerId,
    pub key_id: KeyId,
    pub address: String,
    pub port: u16,
    pub node: NodeDescriptor,
}

/// Kademlia-style routing table. Only the discovery contract is visible here.
pub trait RoutingTable: Send {
    /// Record a peer we have a session with. Returns a node that should be
    /// pinged to decide whether it can be replaced.
    fn add_peer(
        &mut self,
        key_id: &KeyId,
        id: &PeerId,
        address: &str,
        port: u16,
        node: &NodeDescriptor,
    ) -> Option<KnownNode>;

    fn pong_received(&mut self, key_id: &KeyId, id: &PeerId, address: &str, port: u16);

    /// Any message from `key_id` counts as liveness.
    fn touch(&mut self, key_id: &KeyId);

    fn neighbours(&self, key_id: &KeyId) -> Vec<KnownNode>;

    fn random_known_node(&mut self) -> Option<KnownNode>;

    /// Advance the table. Returns target key -> nodes to ask about it.
    fn sync_network(&mut self) -> HashMap<KeyId, Vec<KnownNode>>;

    /// Peers whose sessions the table wants closed.
    fn sessions_to_end(&self) -> Vec<PeerId>;

    fn clear_sessions_to_end(&mut self);
}

/// Local task scheduler.
pub trait TaskCoordinator: Send {
    fn task_headers(&self) -> Vec<TaskHeader>;

    fn add_task_header(&mut self, header: TaskHeader) -> anyhow::Result<()>;

    fn remove_task_header(&mut self, task_id: &str);

    /// A remote node asked to open a task session with us.
    fn start_task_session(
        &mut self,
        node: NodeDescriptor,
        super_node: Option<NodeDescriptor>,
        conn_id: String,
    );
}

/// Local resource server.
pub trait ResourceTransfer: Send {
    /// Full directory of remote resource peers. Never contains the local node.
    fn set_resource_peers(&mut self, peers: HashMap<PeerId, ResourceEndpoint>);

    fn put_resource(&mut self, resource: String, address: String, port: u16, copies: u32);

    fn change_config(&mut self, config: &MeshlinkConfig);
}

/// Source of "now" for every timer in the overlay.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

//! Protocol messages exchanged between overlay peers.
//!
//! Every message is a JSON object with a `type` tag. List payloads that come
//! from other nodes (peers, task headers, resource peers) are carried as raw
//! JSON values so one malformed entry can be skipped without dropping the
//! whole message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Stable identifier of a node (client id).
pub type PeerId = String;

/// Key identifier advertised by a node's key authority.
pub type KeyId = String;

/// Bumped whenever a message changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A dialable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddr {
    pub address: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for HostAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// What a node says about itself: identity plus every address it can be reached on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: PeerId,
    pub key: KeyId,
    #[serde(default)]
    pub prv_addresses: Vec<String>,
    #[serde(default)]
    pub pub_addr: Option<String>,
    #[serde(default)]
    pub prv_port: Option<u16>,
    #[serde(default)]
    pub pub_port: Option<u16>,
    #[serde(default)]
    pub super_node: bool,
}

impl NodeDescriptor {
    pub fn is_super_node(&self) -> bool {
        self.super_node
    }

    /// Addresses to try when dialing this node, public address first.
    /// `port` is used where the descriptor does not carry one.
    pub fn host_candidates(&self, port: u16) -> Vec<HostAddr> {
        let mut out: Vec<HostAddr> = Vec::new();
        if let Some(addr) = self.pub_addr.as_deref().filter(|a| !a.is_empty()) {
            out.push(HostAddr::new(addr, self.pub_port.unwrap_or(port)));
        }
        for addr in self.prv_addresses.iter().filter(|a| !a.is_empty()) {
            let candidate = HostAddr::new(addr.as_str(), self.prv_port.unwrap_or(port));
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out
    }
}

/// Entry of a peers list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: String,
    pub port: u16,
    pub node: NodeDescriptor,
}

/// Entry of the resource-peers directory as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePeerInfo {
    pub client_id: PeerId,
    pub addr: String,
    pub port: u16,
    pub key_id: KeyId,
    pub node: NodeDescriptor,
}

/// Advertisement of a task offered by some node. Fields the overlay does not
/// interpret are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHeader {
    pub task_id: String,
    pub client_id: PeerId,
    pub address: String,
    pub port: u16,
    pub key_id: KeyId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Local trust opinion about one node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalRank {
    pub computing_trust: f64,
    pub requesting_trust: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Timeout,
    Refresh,
    DuplicatePeers,
    SelfConnection,
    BadProtocol,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Hello {
        port: u16,
        client_id: PeerId,
        key_id: KeyId,
        node: NodeDescriptor,
        proto_version: u32,
    },
    Ping,
    Pong,
    Disconnect {
        reason: DisconnectReason,
    },
    GetPeers,
    Peers {
        peers: Vec<Value>,
    },
    GetTasks,
    Tasks {
        headers: Vec<Value>,
    },
    RemoveTask {
        task_id: String,
    },
    FindNode {
        key_id: KeyId,
    },
    GetResourcePeers,
    ResourcePeers {
        peers: Vec<Value>,
    },
    PutResource {
        resource: String,
        address: String,
        port: u16,
        copies: u32,
    },
    /// Sent straight to the node that owns the requested key.
    WantToStartTaskSession {
        node: NodeDescriptor,
        conn_id: String,
        #[serde(default)]
        super_node: Option<NodeDescriptor>,
    },
    /// Delegated request: "if you know `key_id`, put this node in touch with it".
    SetTaskSession {
        key_id: KeyId,
        node: NodeDescriptor,
        conn_id: String,
        #[serde(default)]
        super_node: Option<NodeDescriptor>,
    },
    Gossip {
        gossip: Value,
    },
    StopGossip,
    LocRank {
        node_id: PeerId,
        loc_rank: LocalRank,
    },
    Degree {
        degree: usize,
    },
}

impl PeerMessage {
    /// Wire tag, for logging and the last-messages ring.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::Ping => "ping",
            PeerMessage::Pong => "pong",
            PeerMessage::Disconnect { .. } => "disconnect",
            PeerMessage::GetPeers => "get_peers",
            PeerMessage::Peers { .. } => "peers",
            PeerMessage::GetTasks => "get_tasks",
            PeerMessage::Tasks { .. } => "tasks",
            PeerMessage::RemoveTask { .. } => "remove_task",
            PeerMessage::FindNode { .. } => "find_node",
            PeerMessage::GetResourcePeers => "get_resource_peers",
            PeerMessage::ResourcePeers { .. } => "resource_peers",
            PeerMessage::PutResource { .. } => "put_resource",
            PeerMessage::WantToStartTaskSession { .. } => "want_to_start_task_session",
            PeerMessage::SetTaskSession { .. } => "set_task_session",
            PeerMessage::Gossip { .. } => "gossip",
            PeerMessage::StopGossip => "stop_gossip",
            PeerMessage::LocRank { .. } => "loc_rank",
            PeerMessage::Degree { .. } => "degree",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(bytes.len()));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

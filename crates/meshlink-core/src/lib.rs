//! meshlink-core: shared types, wire messages, configuration and key material.
//! All other meshlink crates depend on this one.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod message;

pub use identity::{Identity, KeysAuth, LocalKeys};
pub use message::{
    DisconnectReason, HostAddr, KeyId, LocalRank, NodeDescriptor, PeerId, PeerInfo, PeerMessage,
    ResourcePeerInfo, TaskHeader,
};

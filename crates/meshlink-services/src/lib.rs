//! meshlink-services: the overlay control plane.
//!
//! All state lives in one [`OverlayService`] owned by an [`OverlayActor`].
//! Everything else talks to it through an [`OverlayHandle`].

pub mod actor;
pub mod churn;
pub mod collaborators;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod gossip;
pub mod registry;
pub mod rendezvous;
pub mod resources;
pub mod routing;
pub mod service;
pub mod tasks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use actor::{Command, OverlayActor, OverlayHandle};
pub use collaborators::{
    Clock, KnownNode, PeerLink, ResourceTransfer, RoutingTable, SystemClock, TaskCoordinator,
    Transport,
};
pub use error::OverlayError;
pub use gossip::NeighbourRank;
pub use registry::{PeerHandle, PeerRegistry, PendingCandidate, SessionId};
pub use rendezvous::{RendezvousRecord, RendezvousRoute};
pub use resources::ResourceEndpoint;
pub use routing::FlatRoutingTable;
pub use service::{LastMessage, MessageSummary, OverlayService, OverlayStatus, PeerSummary};

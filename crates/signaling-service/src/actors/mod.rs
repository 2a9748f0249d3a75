//! Actor model for room state.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room id)
//!         ├── owns the room's router
//!         └── owns every peer and its transports, producers and consumers
//! ```
//!
//! Connections never touch room state directly. They join through the
//! registry and then talk to their room through a [`RoomActorHandle`].

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use messages::{
    JoinOutcome, PeerSnapshot, RegistryStatus, RoomInfo, RoomState,
};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::RoomRegistryHandle;
pub use room::{RoomActorHandle, RoomSettings};

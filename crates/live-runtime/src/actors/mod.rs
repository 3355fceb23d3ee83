//! Actor system for live room state.
//!
//! ```text
//! RoomRegistryActor (singleton, owns root token)
//! └── RoomActor (one per room with at least one connection)
//!     └── members: ConnectionActorHandle + cached role/permissions/status
//!
//! DispatcherActor (singleton): private channels + side effects
//! ConnectionActor (one per client connection): bounded outbound relay
//! ```
//!
//! Every actor is driven through a cloneable handle that sends on an
//! `mpsc` mailbox; request/response calls carry a `oneshot` reply.

pub mod connection;
pub mod dispatcher;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use dispatcher::DispatcherHandle;
pub use messages::{Evicted, RegistryStatus, RoomMember, RoomSnapshot, SideEffect, Unregistered};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::RoomRegistryHandle;
pub use room::RoomActorHandle;

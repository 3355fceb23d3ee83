//! Live Session Runtime Library
//!
//! The real-time core of a webinar platform:
//!
//! - Authenticated duplex connections, many per session and several per identity
//! - Authoritative participant state reconciled across join, leave and
//!   abrupt disconnect
//! - Role/permission checks on every mutating action
//! - Ordered fan-out of chat, poll, Q&A and media-state changes to a room
//! - Opaque peer-to-peer signaling relay
//! - Chunked recording ingestion into a multipart object store
//!
//! # Architecture
//!
//! ```text
//! gateway (WebSocket, identity token)
//! └── runtime::SessionRuntime
//!     ├── permissions (static role table)
//!     ├── store::SessionStore (persisted session document, atomic update)
//!     └── actors
//!         ├── RoomRegistryActor ── RoomActor (one per live room)
//!         ├── ConnectionActor (one per socket)
//!         └── DispatcherActor (private channels, fire-and-forget effects)
//!
//! recording (HTTP) ── RecordingIngestor ── ObjectStorage
//! ```
//!
//! # Modules
//!
//! - [`actors`] - room registry, connection and dispatcher actors
//! - [`config`] - service configuration from environment
//! - [`errors`] - error types with stable wire codes
//! - [`gateway`] - WebSocket endpoint and identity verification
//! - [`recording`] - recording ingestion pipeline and its routes
//! - [`runtime`] - lifecycle, interaction and signaling handlers
//! - [`store`] - session state store

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod model;
pub mod observability;
pub mod permissions;
pub mod protocol;
pub mod recording;
pub mod runtime;
pub mod store;

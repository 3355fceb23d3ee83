//! # Live Runtime Test Utilities
//!
//! Mocks and fixtures for testing the live-session runtime without real
//! infrastructure.
//!
//! ## Modules
//!
//! - `mock_storage` - In-memory object storage with injectable failures
//! - `fixtures` - Session documents and identity tokens
//! - `connection` - Connection endpoint that collects outbound events
//!
//! ## Usage
//!
//! ```rust,ignore
//! use live_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = Arc::new(MemorySessionStore::new());
//!     let session = SessionFixture::new("organizer-1")
//!         .require_approval()
//!         .insert(&store)
//!         .await;
//!
//!     let mut alice = TestConnection::open("alice");
//!     runtime.join(&alice.caller(), &session.room_code.as_str().into()).await?;
//!     let event = alice.next_event().await;
//! }
//! ```

pub mod connection;
pub mod fixtures;
pub mod mock_storage;

pub use connection::*;
pub use fixtures::*;
pub use mock_storage::*;

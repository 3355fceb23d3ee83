//! Secret types for values that must never reach a log line.
//!
//! Re-exports [`secrecy`]. `SecretString` and `SecretBox<T>` print as
//! `[REDACTED]` under `Debug`, so a struct that derives `Debug` while holding
//! one stays safe to pass to `tracing`. Values are zeroized on drop.
//!
//! In the runtime these wrap:
//! - the identity token signing secret
//! - the database URL (it usually embeds a password)
//! - bearer tokens read off an incoming request before verification
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let secret = SecretString::from("hs256-signing-key");
//! assert!(!format!("{secret:?}").contains("hs256"));
//! assert_eq!(secret.expose_secret(), "hs256-signing-key");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

//! Common utilities and types shared across the live-session runtime crates.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for identity token utilities (limits, claims, iat validation)
pub mod jwt;

//! Identity token utilities shared by the runtime and its tests.
//!
//! - Size limit checked BEFORE any decoding
//! - Clock skew constants for `iat` validation
//! - The identity claims carried by a connection token
//!
//! Error messages are deliberately uniform; the specific reason is logged at
//! debug level only.
//!
//! ```rust,ignore
//! use common::jwt::{check_token_size, validate_iat, DEFAULT_CLOCK_SKEW};
//!
//! check_token_size(token)?;
//! // ... verify signature, decode IdentityClaims ...
//! validate_iat(claims.iat, DEFAULT_CLOCK_SKEW)?;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed token size in bytes (8KB).
///
/// Identity tokens are a few hundred bytes. Anything larger is rejected
/// before base64 decoding or signature verification.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default clock skew tolerance for `iat` (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Upper bound on configurable clock skew (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while validating an identity token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds [`MAX_JWT_SIZE_BYTES`].
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token is not a three-part compact JWT.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Signature, algorithm or expiry check failed.
    #[error("The access token is invalid or expired")]
    VerificationFailed,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,

    /// Token subject is empty.
    #[error("The access token is invalid or expired")]
    MissingSubject,
}

// =============================================================================
// Claims
// =============================================================================

/// Claims carried by a participant identity token.
///
/// `sub` is the participant identity the runtime keys membership on. It is
/// redacted in Debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject (participant identity).
    pub sub: String,

    /// Display name shown to other participants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
}

impl fmt::Debug for IdentityClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityClaims")
            .field("sub", &"[REDACTED]")
            .field("name", &self.name)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

impl IdentityClaims {
    /// Creates claims for `sub` valid for `ttl_seconds` from `iat`.
    #[must_use]
    pub fn new(sub: impl Into<String>, name: Option<String>, iat: i64, ttl_seconds: i64) -> Self {
        Self {
            sub: sub.into(),
            name,
            exp: iat + ttl_seconds,
            iat,
        }
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Reject tokens larger than [`MAX_JWT_SIZE_BYTES`] or without the
/// `header.payload.signature` shape.
///
/// # Errors
///
/// `TokenTooLarge` or `MalformedToken`.
pub fn check_token_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    if token.split('.').count() != 3 {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    }

    Ok(())
}

/// Validate the `iat` claim against the current time with `clock_skew`
/// tolerance.
///
/// # Errors
///
/// `IatTooFarInFuture` if `iat` is more than `clock_skew` ahead of now.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic variant of [`validate_iat`] for boundary tests.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // clock_skew is bounded by MAX_CLOCK_SKEW in config parsing
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

//! Identity token verification for the duplex gateway and recording routes.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted
//! - `exp` is enforced; `iat` may not be further ahead than the clock skew
//! - Every failure maps to the same caller-visible message

use crate::errors::RuntimeError;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use common::jwt::{check_token_size, validate_iat, IdentityClaims};
use common::secret::{ExposeSecret, SecretString};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::time::Duration;
use tracing::instrument;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub display_name: Option<String>,
}

/// Verifies HS256 identity tokens against the shared secret.
pub struct IdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    clock_skew: Duration,
}

impl std::fmt::Debug for IdentityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityVerifier")
            .field("decoding_key", &"[REDACTED]")
            .field("clock_skew", &self.clock_skew)
            .finish()
    }
}

impl IdentityVerifier {
    #[must_use]
    pub fn new(secret: &SecretString, clock_skew: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
            clock_skew,
        }
    }

    /// Validate a token and return the identity it carries.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` for every failure, with a generic message.
    #[instrument(skip_all, name = "rt.auth.verify")]
    pub fn verify(&self, token: &str) -> Result<Identity, RuntimeError> {
        check_token_size(token).map_err(|e| {
            tracing::debug!(target: "rt.auth", error = ?e, "Token shape check failed");
            invalid_token()
        })?;

        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!(target: "rt.auth", error = %e, "Token verification failed");
                invalid_token()
            })?
            .claims;

        if let Err(e) = validate_iat(claims.iat, self.clock_skew) {
            tracing::debug!(target: "rt.auth", error = ?e, "Token iat validation failed");
            return Err(invalid_token());
        }
        if claims.sub.trim().is_empty() {
            tracing::debug!(target: "rt.auth", "Token subject is empty");
            return Err(invalid_token());
        }

        Ok(Identity {
            subject: claims.sub,
            display_name: claims.name,
        })
    }

    /// Pull a token from `Authorization: Bearer` or, failing that, the
    /// `token` query parameter, then verify it.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` if no token is present or it does not verify.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Identity, RuntimeError> {
        let token = bearer_token(headers)
            .or(query_token)
            .ok_or_else(|| RuntimeError::Unauthenticated("missing token".to_string()))?;
        self.verify(token)
    }
}

/// The token from an `Authorization: Bearer` header, if well formed.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn invalid_token() -> RuntimeError {
    RuntimeError::Unauthenticated("The access token is invalid or expired".to_string())
}

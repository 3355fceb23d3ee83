//! Connection Gateway.
//!
//! Authenticates each duplex connection from its identity token, binds the
//! resulting identity to a connection actor and routes inbound frames to
//! [`crate::runtime::SessionRuntime`].

pub mod auth;
pub mod ws;

pub use auth::{Identity, IdentityVerifier};

use crate::actors::ActorMetrics;
use crate::runtime::SessionRuntime;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared state for duplex connections.
pub struct GatewayState {
    pub runtime: Arc<SessionRuntime>,
    pub verifier: Arc<IdentityVerifier>,
    pub metrics: Arc<ActorMetrics>,
    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
}

/// Router serving `GET /v1/live`.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/live", get(ws::live_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

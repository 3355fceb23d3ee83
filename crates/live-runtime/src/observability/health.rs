//! Health endpoints served on the health listener.
//!
//! - `GET /health` - liveness, 200 while the process runs
//! - `GET /ready` - readiness, 200 once the store is reachable and the client
//!   listener is bound, 503 before that and during shutdown
//!
//! `/ready` also reports the live room and connection counts as JSON.

use crate::actors::ActorMetrics;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness/readiness flags plus the actor counters shown on `/ready`.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    metrics: Arc<ActorMetrics>,
}

impl HealthState {
    /// New state: live, not ready.
    #[must_use]
    pub fn new(metrics: Arc<ActorMetrics>) -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Called when shutdown begins so the load balancer stops routing here.
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize)]
struct ReadyBody {
    ready: bool,
    rooms: usize,
    connections: usize,
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadyBody>) {
    let ready = state.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyBody {
            ready,
            rooms: state.metrics.room_count(),
            connections: state.metrics.connection_count(),
        }),
    )
}

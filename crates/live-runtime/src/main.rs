//! Live Session Runtime
//!
//! # Servers
//!
//! - Public HTTP server (default: 0.0.0.0:8080): `GET /v1/live` WebSocket
//!   upgrade, the recording routes, and stored recordings under `/recordings`
//! - Health HTTP server (default: 0.0.0.0:8081): liveness, readiness, metrics
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Open the session store (Postgres when `DATABASE_URL` is set)
//! 4. Initialize the actor system and the session runtime
//! 5. Start the health server, then the public server
//! 6. Start the recording sweep
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::secret::ExposeSecret;
use live_runtime::actors::{ActorMetrics, DispatcherHandle, RoomRegistryHandle};
use live_runtime::config::Config;
use live_runtime::gateway::{self, GatewayState, IdentityVerifier};
use live_runtime::observability::{health_router, init_metrics_recorder, HealthState};
use live_runtime::recording::routes::{self as recording_routes, RecordingApi};
use live_runtime::recording::sweep::spawn_sweep;
use live_runtime::recording::{FsObjectStorage, IngestSettings, RecordingIngestor};
use live_runtime::runtime::{RuntimeSettings, SessionRuntime};
use live_runtime::store::{MemorySessionStore, PgSessionStore, SessionStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Timeout for the initial database connection.
const DATABASE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for open connections after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Live Session Runtime");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        persistent_store = config.database_url.is_some(),
        rejoin_media_policy = ?config.rejoin_media_policy,
        recording_min_part_bytes = config.recording_min_part_bytes,
        storage_root = %config.storage_root,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let store = open_store(&config).await?;

    let actor_metrics = ActorMetrics::new();
    let health_state = Arc::new(HealthState::new(Arc::clone(&actor_metrics)));

    let rooms = RoomRegistryHandle::new(Arc::clone(&actor_metrics));
    let shutdown_token = rooms.child_token();
    let dispatcher = DispatcherHandle::new(
        Arc::clone(&store),
        Arc::clone(&actor_metrics),
        config.dispatch_buffer,
        shutdown_token.child_token(),
    );
    let runtime = Arc::new(SessionRuntime::new(
        Arc::clone(&store),
        rooms.clone(),
        dispatcher.clone(),
        RuntimeSettings::from(&config),
    ));
    info!("Actor system initialized");

    let verifier = Arc::new(IdentityVerifier::new(
        &config.identity_token_secret,
        Duration::from_secs(config.clock_skew_seconds),
    ));
    let ingestor = Arc::new(RecordingIngestor::new(
        Arc::clone(&store),
        Arc::new(FsObjectStorage::new(
            &config.storage_root,
            config.storage_public_url.clone(),
            config.recording_min_part_bytes,
        )),
        IngestSettings::from(&config),
    ));

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);
    spawn_server("Health", health_addr, health_app, shutdown_token.child_token()).await?;

    // Public server
    let public_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;
    let gateway_state = Arc::new(GatewayState {
        runtime,
        verifier: Arc::clone(&verifier),
        metrics: Arc::clone(&actor_metrics),
        shutdown: shutdown_token.child_token(),
    });
    let recording_api = Arc::new(RecordingApi {
        ingestor: Arc::clone(&ingestor),
        verifier,
    });
    let public_app = gateway::router(gateway_state)
        .merge(recording_routes::router(recording_api))
        .nest_service("/recordings", ServeDir::new(&config.storage_root));
    spawn_server("Public", public_addr, public_app, shutdown_token.child_token()).await?;

    let sweep_task = spawn_sweep(
        ingestor,
        Duration::from_secs(config.recording_sweep_interval_seconds),
        shutdown_token.child_token(),
    );

    health_state.set_ready();
    info!("Live Session Runtime running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    shutdown_token.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    if let Err(e) = rooms.shutdown().await {
        warn!(error = %e, "Room registry shutdown error");
    }
    dispatcher.cancel();
    if let Err(e) = sweep_task.await {
        warn!(error = %e, "Recording sweep task failed");
    }

    info!("Live Session Runtime shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "live_runtime=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn SessionStore>, Box<dyn std::error::Error>> {
    let Some(database_url) = &config.database_url else {
        warn!("DATABASE_URL not set, using in-memory session store");
        return Ok(Arc::new(MemorySessionStore::new()));
    };

    info!("Connecting to Postgres...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(DATABASE_CONNECT_TIMEOUT)
        .connect(database_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Postgres");
            e
        })?;
    let store = PgSessionStore::new(pool);
    store.migrate().await.map_err(|e| {
        error!(error = %e, "Failed to apply migrations");
        e
    })?;
    info!("Postgres session store ready");
    Ok(Arc::new(store))
}

/// Bind `addr` and serve `app` until `cancel_token` fires.
///
/// Binds before spawning so bind errors fail startup.
async fn spawn_server(
    name: &'static str,
    addr: SocketAddr,
    app: Router,
    cancel_token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(server = name, error = %e, addr = %addr, "Failed to bind server");
        format!("Failed to bind {name} server to {addr}: {e}")
    })?;

    tokio::spawn(async move {
        info!(server = name, addr = %addr, "Server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!(server = name, "Server shutting down");
        });
        if let Err(e) = server.await {
            error!(server = name, error = %e, "Server failed");
        }
    });
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

//! Signaling Service
//!
//! Two-party call-signaling coordinator.
//!
//! # Servers
//!
//! - WebSocket signaling endpoint `/call` (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to the media negotiation engine
//! 4. Build the signaling core
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start WebSocket signaling server
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use signaling_service::config::{redacted_uri, Config};
use signaling_service::engine::kurento::KurentoClient;
use signaling_service::handler::{ServiceSettings, SignalingService};
use signaling_service::observability::{health_router, init_metrics_recorder, HealthState};
use signaling_service::transport::signaling_router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for open connections to drain after shutdown is signalled.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signaling_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Signaling Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        kms_ws_uri = %redacted_uri(&config.kms_ws_uri),
        pairing_strategy = config.pairing_strategy.as_str(),
        room_settle_window_ms = config.room_settle_window.as_millis(),
        establishment_timeout_seconds = config.establishment_timeout.as_secs(),
        chat_enabled = config.chat_enabled,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Engine connectivity gates readiness
    info!(kms_ws_uri = %redacted_uri(&config.kms_ws_uri), "Connecting to media engine...");
    let engine = KurentoClient::connect(
        config.kms_ws_uri.as_str(),
        config.engine_request_timeout,
        shutdown_token.child_token(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to connect to media engine");
        e
    })?;
    health_state.engine_connected();
    info!("Media engine connection established");

    let engine_lost = engine.connection_lost();
    let engine_health = Arc::clone(&health_state);
    let engine_watch_token = shutdown_token.child_token();
    tokio::spawn(async move {
        tokio::select! {
            () = engine_watch_token.cancelled() => {}
            () = engine_lost.cancelled() => {
                error!("Media engine connection lost, marking service not ready");
                engine_health.engine_lost();
            }
        }
    });

    let service = SignalingService::new(
        Arc::new(engine),
        ServiceSettings::from(&config),
        shutdown_token.child_token(),
    );

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
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

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start WebSocket signaling server
    let signaling_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(Arc::clone(&service), shutdown_token.child_token())
        .layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    info!("Signaling Service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.start_draining();

    // Closes client sockets, cancels settle timers and in-flight establishments
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, signaling_task)
        .await
        .is_err()
    {
        warn!(
            grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
            "Signaling server did not stop within grace period"
        );
    }

    info!(
        sessions = service.registry().len().await,
        pairs = service.pipelines().len().await,
        "Signaling Service shutdown complete"
    );
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

//! Room Signaling Service
//!
//! WebSocket signaling server for an SFU media engine.
//!
//! # Servers
//!
//! - WebSocket signaling at `/ws` (default: 0.0.0.0:4443)
//! - HTTP health and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Create the media engine and the room registry
//! 4. Start health HTTP server (liveness, readiness, metrics)
//! 5. Start signaling server
//! 6. Wait for shutdown signal, then stop accepting and drain rooms

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use signaling_service::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings};
use signaling_service::config::Config;
use signaling_service::engine::{LocalEngine, MediaEngine};
use signaling_service::observability::metrics::init_metrics_recorder;
use signaling_service::observability::{health_router, HealthState};
use signaling_service::websocket::{signaling_router, ConnectionSettings, SignalingState};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signaling_service=debug,sig=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Signaling Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        outbound_queue_size = config.outbound_queue_size,
        room_mailbox_size = config.room_mailbox_size,
        media_listen_ip = %config.media_listen_ip,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // No external worker attached: use the in-process engine
    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new());

    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        engine,
        RoomSettings {
            mailbox_size: config.room_mailbox_size,
            transport_config: config.transport_config(),
        },
        Arc::clone(&actor_metrics),
    );
    info!("Room registry started");

    // Servers stop before the registry drains
    let shutdown_token = registry.child_token();

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

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let signaling_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_app = signaling_router(SignalingState {
        registry: registry.clone(),
        settings: ConnectionSettings::from_config(&config),
        metrics: Arc::clone(&actor_metrics),
    });
    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
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
    info!(addr = %signaling_addr, "Signaling server started");

    health_state.set_ready();
    info!("Room Signaling Service running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Not ready first so load balancers stop routing new clients
    health_state.set_not_ready();
    shutdown_token.cancel();

    if let Err(e) = registry.shutdown(config.shutdown_timeout).await {
        warn!(error = %e, "Room registry shutdown error");
    }
    registry.cancel();

    info!(
        connections_remaining = actor_metrics.connection_count(),
        "Room Signaling Service shutdown complete"
    );

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
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

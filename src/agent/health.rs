//! Agent health and metrics HTTP surface
//!
//! Serves the probes the fleet DaemonSet points at: `/healthz` (liveness,
//! the gRPC channel exists), `/readyz` (readiness, at least one UDP capture
//! socket is bound AND the gRPC channel exists), and `/metrics` (prometheus
//! text exposition of the agent registry).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared agent liveness/readiness state.
pub struct AgentHealth {
    /// Set once the gRPC channel object exists.
    pub rpc_connected: AtomicBool,
    /// Set once at least one UDP capture socket is bound.
    pub udp_bound: AtomicBool,
    registry: Registry,
}

impl AgentHealth {
    /// Creates the health state over the agent's metrics registry.
    pub fn new(registry: Registry) -> Arc<Self> {
        Arc::new(Self {
            rpc_connected: AtomicBool::new(false),
            udp_bound: AtomicBool::new(false),
            registry,
        })
    }
}

fn router(health: Arc<AgentHealth>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health)
}

/// Serves the health endpoints until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    health: Arc<AgentHealth>,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "health server listening");

    axum::serve(listener, router(health))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz(State(health): State<Arc<AgentHealth>>) -> impl IntoResponse {
    if health.rpc_connected.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "gRPC channel not established")
    }
}

async fn readyz(State(health): State<Arc<AgentHealth>>) -> impl IntoResponse {
    if !health.udp_bound.load(Ordering::Relaxed) {
        return (StatusCode::SERVICE_UNAVAILABLE, "no WoL UDP port bound");
    }
    if !health.rpc_connected.load(Ordering::Relaxed) {
        return (StatusCode::SERVICE_UNAVAILABLE, "gRPC channel not established");
    }
    (StatusCode::OK, "ready")
}

async fn metrics(State(health): State<Arc<AgentHealth>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = health.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "encoding metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string());
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(error = %e, "converting metrics to string");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string())
        }
    }
}

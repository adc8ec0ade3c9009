//! Operator health probes and metrics exposition
//!
//! The operator pod serves `/healthz` and `/readyz` for its own liveness and
//! readiness probes, plus `/metrics` with the operator registry (event
//! counters, `wol_managed_vms`). Readiness reflects whether the gRPC
//! aggregator is up; the controller itself has no meaningful readiness
//! signal beyond process liveness.

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

/// Shared operator probe state.
pub struct OperatorProbes {
    /// Set once the gRPC aggregator is serving.
    pub grpc_serving: AtomicBool,
    registry: Registry,
}

impl OperatorProbes {
    /// Creates the probe state over the operator's metrics registry.
    pub fn new(registry: Registry) -> Arc<Self> {
        Arc::new(Self {
            grpc_serving: AtomicBool::new(false),
            registry,
        })
    }
}

/// Serves the probe endpoints until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    probes: Arc<OperatorProbes>,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(probes);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "operator probe server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(probes): State<Arc<OperatorProbes>>) -> impl IntoResponse {
    if probes.grpc_serving.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "gRPC server not serving")
    }
}

async fn metrics(State(probes): State<Arc<OperatorProbes>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = probes.registry.gather();

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

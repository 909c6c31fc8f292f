use std::net::SocketAddr;

use axum::{extract::State, routing::get, Json, Router};
use egress_core::EgressService;
use egress_protocol::EgressInfo;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(service: EgressService) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/health", get(status))
        .route("/egress", get(list))
        .with_state(service)
}

async fn status(State(service): State<EgressService>) -> Json<Value> {
    Json(service.status())
}

async fn list(State(service): State<EgressService>) -> Json<Vec<EgressInfo>> {
    Json(service.list())
}

/// Serve the health surface until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    service: EgressService,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

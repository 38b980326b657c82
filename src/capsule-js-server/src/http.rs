//! HTTP transport: `POST /rpc` for request frames and `GET /health` for
//! liveness.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::ops::Service;
use crate::rpc::{self, RpcRequest, RpcResponse};

/// Build the router.
pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rpc", post(handle_rpc))
        .with_state(service)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "capsule-js-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_rpc(
    State(service): State<Arc<Service>>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    Json(rpc::dispatch(&service, request).await)
}

/// Bind and serve until the process is asked to stop.
pub async fn serve(addr: &str, service: Arc<Service>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http transport listening");
    axum::serve(listener, router(service)).await?;
    Ok(())
}

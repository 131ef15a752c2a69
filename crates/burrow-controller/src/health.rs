//! Plain HTTP health listener

use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

async fn healthcheck() -> Json<Value> {
    Json(json!({}))
}

pub async fn run(addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/", get(healthcheck))
        .route("/health", get(healthcheck))
        .layer(TraceLayer::new_for_http());

    tracing::info!(addr = %addr, "Running health HTTP listener");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

use crate::pipeline::BridgeContext;
use crate::status::StatusReport;
use crate::telemetry::{device_id, Value};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct HttpState {
    pub context: Arc<BridgeContext>,
}

#[derive(Debug, Serialize)]
struct DevicesResponse {
    devices: Vec<Value>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_metrics(State(state): State<HttpState>) -> Json<DevicesResponse> {
    let devices = state
        .context
        .buffer
        .snapshot()
        .into_iter()
        .filter(|record| record.as_map().is_some() && device_id(record).is_some())
        .collect();
    Json(DevicesResponse { devices })
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusReport> {
    Json(StatusReport::collect(&state.context, Utc::now()))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics.json", get(get_metrics))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

pub async fn serve(bind: &str, state: HttpState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {bind}"))?;
    tracing::info!(addr=%bind, "query surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

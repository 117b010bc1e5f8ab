use crate::control::ControlStatus;
use crate::error::AppError;
use crate::state::AppState;
use crate::stats::{CounterSnapshot, GatewaySnapshot};
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: String,
    pub gateway: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamsView {
    #[serde(flatten)]
    pub snapshot: GatewaySnapshot,
    /// The broker accepts control commands.
    pub coordinator_connected: bool,
    pub tick_stream_connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedHealth {
    pub status: &'static str,
    pub timestamp: String,
    pub gateway: String,
    #[serde(flatten)]
    pub streams: StreamsView,
    pub control: ControlStatus,
    pub counters: CounterSnapshot,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "OK",
        timestamp: now(),
        gateway: state.config.gateway_id.clone(),
    })
}

async fn streams_view(state: &AppState) -> Result<StreamsView, AppError> {
    Ok(StreamsView {
        snapshot: state.gateway.snapshot().await?,
        coordinator_connected: state.broker.is_connected(),
        tick_stream_connected: state.gateway.stats().tick_stream(),
    })
}

pub async fn health_detailed(State(state): State<AppState>) -> Result<Json<DetailedHealth>, AppError> {
    let streams = streams_view(&state).await?;
    Ok(Json(DetailedHealth {
        status: "OK",
        timestamp: now(),
        gateway: state.config.gateway_id.clone(),
        streams,
        control: state.control.status(),
        counters: state.gateway.stats().counters(),
    }))
}

/// Sessions and per-stream demand as seen by this gateway.
pub async fn list_streams(State(state): State<AppState>) -> Result<Json<StreamsView>, AppError> {
    Ok(Json(streams_view(&state).await?))
}

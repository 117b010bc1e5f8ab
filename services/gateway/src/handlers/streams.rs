use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use types::stream::StreamKey;

fn manual_key(state: &AppState, instrument: &str, interval: &str) -> Result<StreamKey, AppError> {
    state.rate_limiter.check_rate_limit("api:manual", 10, 1.0)?;
    Ok(StreamKey::parse(instrument, interval)?)
}

/// Start a stream under this gateway's manual origin, independent of any
/// client demand.
pub async fn force_start(
    State(state): State<AppState>,
    Path((instrument, interval)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let key = manual_key(&state, &instrument, &interval)?;
    let origin = state.config.manual_origin();
    state.control.start_as(&key, &origin)?;
    tracing::info!(stream = %key, origin = %origin, "Manual stream start requested");
    Ok(Json(json!({ "message": format!("Requested start for {key}") })))
}

pub async fn force_stop(
    State(state): State<AppState>,
    Path((instrument, interval)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let key = manual_key(&state, &instrument, &interval)?;
    let origin = state.config.manual_origin();
    state.control.stop_as(&key, &origin)?;
    tracing::info!(stream = %key, origin = %origin, "Manual stream stop requested");
    Ok(Json(json!({ "message": format!("Requested stop for {key}") })))
}

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use types::bar::Bar;
use types::stream::StreamKey;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub interval: Option<String>,
    pub limit: Option<usize>,
}

/// Rolling window for one stream, newest `limit` bars last.
pub async fn get_history(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Bar>>, AppError> {
    state.rate_limiter.check_rate_limit("api:history", 100, 20.0)?;

    let key = StreamKey::parse(&instrument, query.interval.as_deref().unwrap_or("1m"))?;
    let limit = query.limit.unwrap_or(state.config.window.history_limit);
    if limit == 0 {
        return Err(AppError::BadRequest("limit must be positive".into()));
    }

    let mut bars = state.cache.fetch_or_load(&key).await?;
    if bars.len() > limit {
        bars.drain(..bars.len() - limit);
    }
    Ok(Json(bars))
}

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// `GET /api/ingest/stats`: request counter, queue depth and the sizes of
/// the in-memory tables.
pub async fn ingest_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.aggregator.stats().await;
    Json(json!({ "data": stats }))
}

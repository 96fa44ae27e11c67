use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;

use pagetally_core::clock::{format_date, format_minute};

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeQuery {
    pub domain: String,
    /// `YYYY-MM-DD HH:MM`; defaults to the start of today.
    pub start_date: Option<String>,
}

/// `GET /api/realtime?domain=..&startDate=..`: live load right now plus the
/// snapshots recorded after `startDate`.
#[tracing::instrument(skip(state))]
pub async fn realtime(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RealtimeQuery>,
) -> Result<impl IntoResponse, AppError> {
    if query.domain.is_empty() {
        return Err(AppError::BadRequest("domain is required".to_string()));
    }
    let since = match query.start_date.as_deref() {
        Some(raw) => {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").map_err(|_| {
                AppError::BadRequest("startDate must be YYYY-MM-DD HH:MM".to_string())
            })?;
            raw.to_string()
        }
        None => format!("{} 00:00", format_date(state.aggregator.today())),
    };

    let current = state
        .aggregator
        .read_realtime(&query.domain, &format_minute(state.aggregator.now()))
        .await?;
    let history = state
        .db
        .realtime_snapshots_since(&query.domain, &since)
        .await?;

    Ok(Json(json!({
        "data": {
            "current": current,
            "history": history,
        }
    })))
}

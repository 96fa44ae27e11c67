use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use crate::{engine::top::merge_top_content, error::AppError, state::AppState};

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;
/// Rows taken from each source before today's live and settled counters are
/// combined.
const TODAY_MERGE_WINDOW: usize = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopContentQuery {
    pub domain: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<usize>,
}

fn parse_date(raw: Option<&str>, default: NaiveDate, field: &str) -> Result<NaiveDate, AppError> {
    match raw {
        None => Ok(default),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| AppError::BadRequest(format!("{field} must be YYYY-MM-DD"))),
    }
}

/// `GET /api/top-content?domain=..&startDate=..&endDate=..&limit=..`
///
/// Pages ranked by page views. A range covering only today combines the live
/// shared-store counters with whatever of today is already in the durable
/// store; any other range is read from the durable store.
#[tracing::instrument(skip(state))]
pub async fn top_content(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopContentQuery>,
) -> Result<impl IntoResponse, AppError> {
    if query.domain.is_empty() {
        return Err(AppError::BadRequest("domain is required".to_string()));
    }
    let today = state.aggregator.today();
    let start = parse_date(query.start_date.as_deref(), today, "startDate")?;
    let end = parse_date(query.end_date.as_deref(), start, "endDate")?;
    if start > end {
        return Err(AppError::BadRequest(
            "startDate must not be after endDate".to_string(),
        ));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let rows = if start == today && end == today {
        let live = state
            .aggregator
            .top_content_today(&query.domain, TODAY_MERGE_WINDOW)
            .await?;
        let settled = state
            .db
            .top_content(&query.domain, today, today, TODAY_MERGE_WINDOW)
            .await?;
        merge_top_content(live, settled, limit)
    } else {
        state.db.top_content(&query.domain, start, end, limit).await?
    };

    Ok(Json(json!({ "data": rows })))
}

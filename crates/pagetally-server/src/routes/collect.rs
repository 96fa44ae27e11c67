use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde_json::json;

use pagetally_core::event::{PageClose, PageView};
use pagetally_core::visitor::{compute_visitor_id, domain_from_url};

use crate::{error::AppError, state::AppState};

/// `POST /api/webdata`: a page was opened.
///
/// Body: `{ "p": page info, "w": webflow seed, "b": browsing seed }`.
///
/// The handler only fills what the client left out and enqueues:
/// - visitor id: `sha256(salt_epoch + ip + user_agent)[0..8]` as 16 hex chars,
/// - IP: first `X-Forwarded-For` entry,
/// - domain: host of the page URL.
///
/// ## Response
/// `202 Accepted` with `{ "ok": true }`, `503` once shutdown has begun.
#[tracing::instrument(skip(state, headers, view))]
pub async fn page_view(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut view): Json<PageView>,
) -> Result<impl IntoResponse, AppError> {
    if view.page.url.is_empty() && view.webflow.url.is_empty() {
        return Err(AppError::BadRequest("url is required".to_string()));
    }
    if view.page.url.is_empty() {
        view.page.url = view.webflow.url.clone();
    }

    let client_ip = extract_client_ip(&headers);
    if view.browsing.ip.is_empty() {
        view.browsing.ip = client_ip.clone();
    }
    if view.browsing.uid.is_empty() {
        view.browsing.uid = compute_visitor_id(&client_ip, &extract_user_agent(&headers));
    }
    if view.page.domain.is_empty() {
        view.page.domain = domain_from_url(&view.page.url).unwrap_or_default();
    }

    state.aggregator.submit_page_view(view).await?;

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "ok": true })),
    ))
}

/// `POST /api/closeweb`: a page was closed after `duration` seconds.
#[tracing::instrument(skip(state, headers, close))]
pub async fn page_close(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut close): Json<PageClose>,
) -> Result<impl IntoResponse, AppError> {
    if close.url.is_empty() {
        return Err(AppError::BadRequest("url is required".to_string()));
    }
    if close.duration < 0 {
        return Err(AppError::BadRequest("duration must be >= 0".to_string()));
    }

    let client_ip = extract_client_ip(&headers);
    if close.ip.is_empty() {
        close.ip = client_ip.clone();
    }
    if close.uid.is_empty() {
        close.uid = compute_visitor_id(&client_ip, &extract_user_agent(&headers));
    }
    if close.domain.is_empty() {
        close.domain = domain_from_url(&close.url).unwrap_or_default();
    }

    state.aggregator.submit_page_close(close).await?;

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "ok": true })),
    ))
}

/// Extract the real client IP from `X-Forwarded-For` (first entry).
///
/// Falls back to `"unknown"` when the header is absent.
fn extract_client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn extract_user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

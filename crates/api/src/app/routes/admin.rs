//! Operator routes: event listings, dead letters, bus health and requeue.
//!
//! Everything here is read-only except `POST /admin/events/:id/requeue`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::dto::{self, ListEventsQuery, MetricsQuery, PageQuery};
use crate::app::{errors, services::AppServices};

const DEFAULT_WINDOW_HOURS: i64 = 24;
const MAX_WINDOW_HOURS: i64 = 24 * 365;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/events", get(list_events))
        .route("/events/:id", get(get_event))
        .route("/events/:id/requeue", post(requeue_event))
        .route("/dead-letters", get(list_dead_letters))
        .route("/metrics", get(metrics))
        .route("/handlers", get(list_handlers))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/events - Events newest first, filtered and paginated
pub async fn list_events(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListEventsQuery>,
) -> axum::response::Response {
    let (filter, pagination) = match query.into_parts() {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };

    match services.monitor.list_events(filter, pagination).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/events/:id - One event with its handler history
pub async fn get_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_event_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.monitor.event_detail(id).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("event {id} not found"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/events/:id/requeue - Reset a failed or dead-lettered event and run it once
pub async fn requeue_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_event_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.ingestion.requeue(id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /admin/dead-letters
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<PageQuery>,
) -> axum::response::Response {
    match services.monitor.dead_letters(query.pagination()).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/metrics?window_hours= - Bus health over a trailing window
pub async fn metrics(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<MetricsQuery>,
) -> axum::response::Response {
    let hours = query.window_hours.unwrap_or(DEFAULT_WINDOW_HOURS);
    if !(1..=MAX_WINDOW_HOURS).contains(&hours) {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_window",
            format!("window_hours must be between 1 and {MAX_WINDOW_HOURS}"),
        );
    }

    match services.monitor.health(chrono::Duration::hours(hours)).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/handlers - The routing table the dispatcher runs with
pub async fn list_handlers(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let routes = services.dispatcher().registry().describe();
    Json(serde_json::json!({ "routes": routes })).into_response()
}

//! Producer endpoint: publish one event and await its first dispatch.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use marketflow_events::IngestRequest;

use crate::app::{dto::IngestResponse, errors, services::AppServices};

/// POST /events
pub async fn ingest(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_json",
                rejection.body_text(),
            );
        }
    };

    match services.ingestion.ingest(request).await {
        Ok(outcome) => (StatusCode::OK, Json(IngestResponse::from(outcome))).into_response(),
        Err(e) => errors::ingest_error_to_response(e),
    }
}

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use marketflow_infra::{DispatchError, IngestError, StoreError};

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match err {
        IngestError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        IngestError::Store(e) => store_error_to_response(e),
    }
}

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("event {id} not found"))
        }
        DispatchError::NotDispatchable { id, status } => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("event {id} is {status} and cannot be requeued"),
        ),
        DispatchError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("event {id} not found"))
        }
        StoreError::InvalidTransition { .. } | StoreError::ClaimLost { .. } => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        StoreError::Integrity(_) | StoreError::Storage(_) => {
            tracing::error!(error = %err, "store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

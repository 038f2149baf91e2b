use axum::{Router, routing::post};

pub mod admin;
pub mod events;
pub mod system;

/// Router for the producer and operator endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/events", post(events::ingest))
        .nest("/admin", admin::router())
}

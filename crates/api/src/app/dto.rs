use serde::{Deserialize, Serialize};

use marketflow_core::EventId;
use marketflow_events::EventStatus;
use marketflow_infra::IngestOutcome;
use marketflow_infra::store::{EventFilter, Pagination};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<String>,
    pub event_type: Option<String>,
    pub store_id: Option<String>,
    pub aggregate_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListEventsQuery {
    pub fn into_parts(self) -> Result<(EventFilter, Pagination), axum::response::Response> {
        let status = match non_blank(self.status) {
            Some(raw) => Some(raw.parse::<EventStatus>().map_err(|e| {
                errors::json_error(
                    axum::http::StatusCode::BAD_REQUEST,
                    "invalid_status",
                    e.to_string(),
                )
            })?),
            None => None,
        };

        let filter = EventFilter {
            status,
            event_type: non_blank(self.event_type),
            store_id: non_blank(self.store_id),
            aggregate_id: non_blank(self.aggregate_id),
            created_after: None,
        };
        Ok((filter, Pagination::new(self.limit, self.offset)))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PageQuery {
    pub fn pagination(&self) -> Pagination {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    pub window_hours: Option<i64>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub event_id: EventId,
    pub created: bool,
    pub skipped: bool,
    pub handlers_run: usize,
    pub status: EventStatus,
}

impl From<IngestOutcome> for IngestResponse {
    fn from(outcome: IngestOutcome) -> Self {
        Self {
            success: outcome.all_success,
            event_id: outcome.event_id,
            created: outcome.created,
            skipped: outcome.skipped,
            handlers_run: outcome.handlers_run,
            status: outcome.status,
        }
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_event_id(raw: &str) -> Result<EventId, axum::response::Response> {
    raw.parse::<EventId>().map_err(|e| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_id",
            e.to_string(),
        )
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

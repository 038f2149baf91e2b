//! Producer-facing ingestion request and its validation.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::event::{NewEvent, default_aggregate_type};

/// The tuple a producer submits.
///
/// Every field is optional at the wire level so that a missing required field
/// surfaces as a validation error instead of a deserialization failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub event_type: Option<String>,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub store_id: Option<String>,
    pub payload: Option<JsonValue>,
}

/// Caller error: rejected synchronously, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestValidationError {
    #[error("`{0}` is required")]
    MissingField(&'static str),
}

impl IngestRequest {
    pub fn new(event_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            aggregate_id: Some(aggregate_id.into()),
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = Some(store_id.into());
        self
    }

    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Check required fields and fill defaults.
    pub fn validate(self, max_retries: u32) -> Result<NewEvent, IngestValidationError> {
        let event_type =
            non_blank(self.event_type).ok_or(IngestValidationError::MissingField("event_type"))?;
        let aggregate_id = non_blank(self.aggregate_id)
            .ok_or(IngestValidationError::MissingField("aggregate_id"))?;
        let aggregate_type = non_blank(self.aggregate_type)
            .unwrap_or_else(|| default_aggregate_type(&event_type).to_string());

        Ok(NewEvent {
            event_type,
            aggregate_type,
            aggregate_id,
            store_id: non_blank(self.store_id),
            payload: self
                .payload
                .filter(|p| !p.is_null())
                .unwrap_or_else(|| JsonValue::Object(Default::default())),
            max_retries,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

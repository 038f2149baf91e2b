use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use marketflow_core::EventId;

use crate::event::EventRecord;

/// Everything a handler gets to see about the event it runs for.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerContext {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_id: String,
    pub store_id: Option<String>,
    pub payload: JsonValue,
}

impl HandlerContext {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            event_id: record.id,
            event_type: record.event_type.clone(),
            aggregate_id: record.aggregate_id.clone(),
            store_id: record.store_id.clone(),
            payload: record.payload.clone(),
        }
    }

    pub fn require_store_id(&self) -> Result<&str, HandlerError> {
        self.store_id
            .as_deref()
            .ok_or_else(|| HandlerError::InvalidPayload("store_id is required".to_string()))
    }

    pub fn payload_str(&self, field: &str) -> Result<&str, HandlerError> {
        self.payload
            .get(field)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| HandlerError::InvalidPayload(format!("missing string field `{field}`")))
    }

    pub fn payload_i64(&self, field: &str) -> Result<i64, HandlerError> {
        self.payload
            .get(field)
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| HandlerError::InvalidPayload(format!("missing integer field `{field}`")))
    }

    pub fn optional_payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }
}

/// Why a handler run failed.
///
/// Every variant is recoverable from the bus' point of view: the event goes to
/// `failed` and is retried until its budget runs out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("downstream failure: {0}")]
    Downstream(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("handler timed out after {0} ms")]
    TimedOut(u64),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// A named unit of side-effect logic run by the dispatcher.
///
/// ## Idempotency
///
/// A retry re-runs **every** handler of the event, including those that
/// already succeeded on an earlier attempt. Implementations that mutate
/// external state must check that state first (e.g. "escrow already exists
/// for this order") instead of relying on the bus to remember partial
/// progress.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

/// Adapter that turns an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

/// Shorthand for `Arc::new(FnHandler::new(f))`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(payload: JsonValue) -> HandlerContext {
        HandlerContext {
            event_id: EventId::new(),
            event_type: "order.created".to_string(),
            aggregate_id: "ord_1".to_string(),
            store_id: None,
            payload,
        }
    }

    #[test]
    fn payload_accessors_report_the_missing_field() {
        let ctx = ctx(serde_json::json!({"currency": "KES", "total_amount": "12"}));

        assert_eq!(ctx.payload_str("currency").unwrap(), "KES");
        assert_eq!(
            ctx.payload_i64("total_amount").unwrap_err(),
            HandlerError::InvalidPayload("missing integer field `total_amount`".to_string())
        );
        assert!(ctx.require_store_id().is_err());
    }

    #[tokio::test]
    async fn closures_can_act_as_handlers() {
        let handler = handler_fn(|ctx: HandlerContext| async move {
            if ctx.aggregate_id == "ord_1" {
                Ok(())
            } else {
                Err(HandlerError::Rejected(ctx.aggregate_id))
            }
        });

        assert!(handler.handle(&ctx(JsonValue::Null)).await.is_ok());
    }
}

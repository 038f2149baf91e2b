//! Producer entry point: validate, deduplicate, store, dispatch.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use marketflow_core::EventId;
use marketflow_events::{EventStatus, IngestRequest, IngestValidationError};

use crate::dispatcher::{DispatchError, DispatchReport, Dispatcher};
use crate::store::{EventStore, InsertOutcome, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] IngestValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What an ingest call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub event_id: EventId,
    /// A new row was inserted (as opposed to reusing one with the same key).
    pub created: bool,
    /// No dispatch ran: the event was already completed or in flight.
    pub skipped: bool,
    pub handlers_run: usize,
    pub all_success: bool,
    pub status: EventStatus,
}

pub struct IngestionService<S> {
    dispatcher: Arc<Dispatcher<S>>,
}

impl<S: EventStore> IngestionService<S> {
    pub fn new(dispatcher: Arc<Dispatcher<S>>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    /// Store the event (once per idempotency key) and run one attempt.
    ///
    /// The caller awaits only this attempt; later retries belong to the sweep.
    #[instrument(
        skip_all,
        fields(event_type = ?request.event_type, aggregate_id = ?request.aggregate_id)
    )]
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, IngestError> {
        let new_event = request.validate(self.dispatcher.retries().default_max_retries())?;
        let now = self.dispatcher.clock().now();

        let InsertOutcome { record, created } =
            self.dispatcher.store().insert_or_get(new_event, now).await?;

        if record.status == EventStatus::Completed {
            info!(event_id = %record.id, "event already completed, skipping");
            return Ok(skipped(record.id, created, record.status));
        }

        match self.dispatcher.dispatch(record.id).await {
            Ok(report) => Ok(IngestOutcome {
                event_id: report.event_id,
                created,
                skipped: false,
                handlers_run: report.handlers_run,
                all_success: report.all_success,
                status: report.status,
            }),
            Err(DispatchError::NotDispatchable { id, status }) => {
                info!(event_id = %id, %status, "event held elsewhere, skipping dispatch");
                Ok(skipped(id, created, status))
            }
            Err(DispatchError::NotFound(id)) => Err(StoreError::NotFound(id).into()),
            Err(DispatchError::Store(e)) => Err(e.into()),
        }
    }

    /// Operator reset of a failed or dead-lettered event, then one attempt.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn requeue(&self, event_id: EventId) -> Result<DispatchReport, DispatchError> {
        match self.dispatcher.store().requeue(event_id).await {
            Ok(_) => {}
            Err(StoreError::NotFound(id)) => return Err(DispatchError::NotFound(id)),
            Err(StoreError::InvalidTransition { id, status }) => {
                return Err(DispatchError::NotDispatchable { id, status });
            }
            Err(e) => return Err(e.into()),
        }

        info!("event requeued by operator");
        self.dispatcher.dispatch(event_id).await
    }
}

fn skipped(event_id: EventId, created: bool, status: EventStatus) -> IngestOutcome {
    IngestOutcome {
        event_id,
        created,
        skipped: true,
        handlers_run: 0,
        all_success: status == EventStatus::Completed,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use marketflow_core::ManualClock;
    use marketflow_events::{
        HandlerCatalog, HandlerContext, HandlerError, HandlerRegistry, RetryPolicy, RoutingTable,
        handler_fn,
    };

    use crate::retry::RetryManager;
    use crate::runtime::HandlerRuntime;
    use crate::store::{Claim, EventQuery, InMemoryEventStore};

    fn service(fail: bool) -> IngestionService<Arc<InMemoryEventStore>> {
        let handler = handler_fn(move |_ctx: HandlerContext| async move {
            if fail {
                Err(HandlerError::Rejected("no".to_string()))
            } else {
                Ok(())
            }
        });
        let registry = HandlerRegistry::build(
            &RoutingTable::new().route("delivery.confirmed", &["release_escrow", "audit_log"]),
            &HandlerCatalog::new()
                .register("release_escrow", handler.clone())
                .register("audit_log", handler),
        )
        .unwrap();

        IngestionService::new(Arc::new(Dispatcher::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(registry),
            HandlerRuntime::default(),
            RetryManager::new(RetryPolicy::fixed(3, Duration::from_secs(300))),
            Arc::new(ManualClock::default()),
        )))
    }

    #[tokio::test]
    async fn second_ingest_of_completed_event_is_skipped() {
        let service = service(false);
        let request = IngestRequest::new("delivery.confirmed", "ord_9");

        let first = service.ingest(request.clone()).await.unwrap();
        assert!(first.created);
        assert!(!first.skipped);
        assert_eq!(first.handlers_run, 2);
        assert_eq!(first.status, EventStatus::Completed);

        let second = service.ingest(request).await.unwrap();
        assert_eq!(second.event_id, first.event_id);
        assert!(second.skipped);
        assert!(!second.created);
        assert_eq!(second.handlers_run, 0);

        let logs = service.dispatcher().store().logs_for_event(first.event_id).await.unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn in_flight_event_is_not_dispatched_twice() {
        let service = service(false);
        let store = service.dispatcher().store();
        let request = IngestRequest::new("delivery.confirmed", "ord_10");

        // Simulate a concurrent caller that stored and claimed the event first.
        let new_event = request.clone().validate(3).unwrap();
        let now = chrono::Utc::now();
        let id = store
            .insert_or_get(new_event, now)
            .await
            .unwrap()
            .record
            .id;
        assert!(matches!(
            store.claim(id, &[EventStatus::Pending], now).await.unwrap(),
            Claim::Claimed(_)
        ));

        let outcome = service.ingest(request).await.unwrap();
        assert_eq!(outcome.event_id, id);
        assert!(outcome.skipped);
        assert_eq!(outcome.status, EventStatus::Processing);

        let page = store
            .list_events(Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn validation_errors_are_never_persisted() {
        let service = service(false);
        let err = service
            .ingest(IngestRequest::new("delivery.confirmed", " "))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Validation(IngestValidationError::MissingField("aggregate_id"))
        ));
        let counts = service.dispatcher().store().status_counts(None).await.unwrap();
        assert_eq!(counts.total(), 0);
    }

    #[tokio::test]
    async fn requeue_resets_budget_and_dispatches() {
        let service = service(true);
        let outcome = service
            .ingest(IngestRequest::new("delivery.confirmed", "ord_11"))
            .await
            .unwrap();
        assert_eq!(outcome.status, EventStatus::Failed);

        let report = service.requeue(outcome.event_id).await.unwrap();
        assert_eq!(report.attempt, 1);
        assert_eq!(report.retry_count, 1);
        assert_eq!(report.status, EventStatus::Failed);

        let completed = self::service(false);
        let done = completed
            .ingest(IngestRequest::new("delivery.confirmed", "ord_12"))
            .await
            .unwrap();
        assert!(matches!(
            completed.requeue(done.event_id).await,
            Err(DispatchError::NotDispatchable {
                status: EventStatus::Completed,
                ..
            })
        ));
    }
}

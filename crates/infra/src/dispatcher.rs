//! Runs the routed handlers of one event and writes the attempt's outcome.
//!
//! ## Flow
//!
//! 1. Claim the event (`status → processing`) with a conditional write
//! 2. Run every routed handler in order, one log row per run
//! 3. Resolve the attempt: `completed`, or hand the last failure to the
//!    [`RetryManager`]
//!
//! A failing handler never stops the ones after it.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use marketflow_core::{Clock, EventId, LogId};
use marketflow_events::{
    AttemptResolution, EventRecord, EventStatus, HandlerContext, HandlerExecutionLog,
    HandlerRegistry,
};

use crate::retry::RetryManager;
use crate::runtime::HandlerRuntime;
use crate::store::{Claim, EventStore, StoreError};

/// Statuses a direct dispatch may claim from.
///
/// `max_retries_exceeded` is included because only operator paths (re-ingest,
/// requeue) call [`Dispatcher::dispatch`]; the sweep claims on its own.
pub const DISPATCHABLE: [EventStatus; 3] = [
    EventStatus::Pending,
    EventStatus::Failed,
    EventStatus::MaxRetriesExceeded,
];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event not found: {0}")]
    NotFound(EventId),

    #[error("event {id} is {status} and cannot be dispatched")]
    NotDispatchable { id: EventId, status: EventStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub event_id: EventId,
    pub all_success: bool,
    pub handlers_run: usize,
    pub attempt: u32,
    pub status: EventStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

pub struct Dispatcher<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    runtime: HandlerRuntime,
    retries: RetryManager,
    clock: Arc<dyn Clock>,
}

impl<S: EventStore> Dispatcher<S> {
    pub fn new(
        store: S,
        registry: Arc<HandlerRegistry>,
        runtime: HandlerRuntime,
        retries: RetryManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            runtime,
            retries,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn retries(&self) -> &RetryManager {
        &self.retries
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Claim `event_id` and run one attempt.
    pub async fn dispatch(&self, event_id: EventId) -> Result<DispatchReport, DispatchError> {
        let now = self.clock.now();
        match self.store.claim(event_id, &DISPATCHABLE, now).await {
            Ok(Claim::Claimed(record)) => self.dispatch_claimed(record).await,
            Ok(Claim::Held(status)) => Err(DispatchError::NotDispatchable {
                id: event_id,
                status,
            }),
            Err(StoreError::NotFound(id)) => Err(DispatchError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Run one attempt for a record this caller has already claimed.
    #[instrument(
        skip_all,
        fields(
            event_id = %record.id,
            event_type = %record.event_type,
            attempt = record.attempts
        )
    )]
    pub async fn dispatch_claimed(
        &self,
        record: EventRecord,
    ) -> Result<DispatchReport, DispatchError> {
        let attempt = record.attempts;
        let handlers = self.registry.handlers_for(&record.event_type);

        if handlers.is_empty() {
            debug!("no handlers routed for event type; completing");
        }

        let (handlers_run, last_error) = match self.run_handlers(&record, attempt).await {
            Ok(result) => result,
            Err(e) => {
                self.release(&record, &e).await;
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let resolution = match last_error {
            None => AttemptResolution::Completed { processed_at: now },
            Some(err) => self.retries.on_failure(&record, err, now),
        };

        let updated = match self.store.resolve(record.id, attempt, &resolution).await {
            Ok(updated) => updated,
            Err(e) => {
                self.release(&record, &e).await;
                return Err(e.into());
            }
        };
        let all_success = updated.status == EventStatus::Completed;

        if all_success {
            info!(handlers_run, "event completed");
        } else {
            warn!(
                handlers_run,
                status = %updated.status,
                retry_count = updated.retry_count,
                "event attempt failed"
            );
        }

        Ok(DispatchReport {
            event_id: updated.id,
            all_success,
            handlers_run,
            attempt,
            status: updated.status,
            retry_count: updated.retry_count,
            error_message: updated.error_message,
        })
    }

    /// Give back a claim whose run hit a store error, as a failed attempt.
    ///
    /// If this write fails too, the row stays `processing` until the sweep
    /// reclaims it once the processing lease runs out.
    async fn release(&self, record: &EventRecord, cause: &StoreError) {
        if matches!(
            cause,
            StoreError::ClaimLost { .. } | StoreError::InvalidTransition { .. }
        ) {
            // Someone else owns the row now.
            return;
        }

        let resolution = self.retries.on_failure(
            record,
            format!("store error: {cause}"),
            self.clock.now(),
        );
        match self.store.resolve(record.id, record.attempts, &resolution).await {
            Ok(released) => {
                warn!(
                    error = %cause,
                    status = %released.status,
                    "released claim after store error"
                );
            }
            Err(e) => {
                error!(
                    error = %e,
                    cause = %cause,
                    "failed to release claim; left for the processing lease"
                );
            }
        }
    }

    /// Returns how many handlers ran and the last failure seen, if any.
    async fn run_handlers(
        &self,
        record: &EventRecord,
        attempt: u32,
    ) -> Result<(usize, Option<String>), StoreError> {
        let handlers = self.registry.handlers_for(&record.event_type);
        let ctx = HandlerContext::from_record(record);
        let mut last_error = None;

        for (position, handler) in handlers.iter().enumerate() {
            let run = self.runtime.run(handler, ctx.clone()).await;

            self.store
                .append_log(HandlerExecutionLog {
                    id: LogId::new(),
                    event_id: record.id,
                    handler_name: run.handler_name,
                    attempt,
                    position: u32::try_from(position).unwrap_or(u32::MAX),
                    status: run.status,
                    duration_ms: run.duration_ms,
                    error_message: run.error.clone(),
                    created_at: self.clock.now(),
                })
                .await?;

            if let Some(err) = run.error {
                last_error = Some(format!("{}: {}", handler.name(), err));
            }
        }

        Ok((handlers.len(), last_error))
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use marketflow_core::EventId;
use marketflow_events::{
    AttemptResolution, EventRecord, EventStatus, HandlerExecutionLog, NewEvent,
};

/// Event store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// The row exists but is not in a state that allows the requested move.
    #[error("event {id} cannot transition from {status}")]
    InvalidTransition { id: EventId, status: EventStatus },

    /// The log row or event row would violate an append-only or unique rule.
    /// The event was reclaimed after this run's lease expired; the run no
    /// longer owns it.
    #[error("event {id} attempt {attempt} no longer holds the claim")]
    ClaimLost { id: EventId, attempt: u32 },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of [`EventStore::insert_or_get`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub record: EventRecord,
    /// `false` when the idempotency key already existed.
    pub created: bool,
}

/// Result of a single-event claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The row was flipped to `processing` by this caller.
    Claimed(EventRecord),
    /// The row exists but its status was not claimable.
    Held(EventStatus),
}

/// Cutoffs for one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepCutoffs {
    /// `failed` events with `next_retry_at <= now` are due. New claims are
    /// stamped with this instant.
    pub now: DateTime<Utc>,
    /// `pending` events created at or before this were never dispatched.
    pub orphaned_before: DateTime<Utc>,
    /// `processing` events claimed at or before this lost their worker.
    pub lease_expired_before: DateTime<Utc>,
}

/// Durable home of bus events and their handler history.
///
/// Every state change is a single conditional write, so two dispatchers can
/// never both claim the same event.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event, or return the stored one when its idempotency key
    /// is already taken. Never creates a second row for the same key.
    async fn insert_or_get(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError>;

    /// Atomically move `id` to `processing` if its current status is one of
    /// `from`, bumping `attempts` and stamping `claimed_at = now`. Returns
    /// [`StoreError::NotFound`] for unknown ids.
    async fn claim(
        &self,
        id: EventId,
        from: &[EventStatus],
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError>;

    /// Claim up to `limit` events the sweep should run, oldest first:
    /// - `failed` events whose `next_retry_at <= cutoffs.now`
    /// - `pending` events created at or before `cutoffs.orphaned_before`
    /// - `processing` events claimed at or before `cutoffs.lease_expired_before`
    async fn claim_due(
        &self,
        cutoffs: SweepCutoffs,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Write the outcome of run number `attempt`. Only valid while the event
    /// is `processing` under that same run; a reclaimed event yields
    /// [`StoreError::ClaimLost`].
    async fn resolve(
        &self,
        id: EventId,
        attempt: u32,
        resolution: &AttemptResolution,
    ) -> Result<EventRecord, StoreError>;

    /// Operator reset: `failed` or `max_retries_exceeded` back to `pending`
    /// with a fresh retry budget.
    async fn requeue(&self, id: EventId) -> Result<EventRecord, StoreError>;

    /// Append one handler execution row. Rows are never updated or deleted.
    async fn append_log(&self, log: HandlerExecutionLog) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn insert_or_get(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        (**self).insert_or_get(event, now).await
    }

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        (**self).get(id).await
    }

    async fn claim(
        &self,
        id: EventId,
        from: &[EventStatus],
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        (**self).claim(id, from, now).await
    }

    async fn claim_due(
        &self,
        cutoffs: SweepCutoffs,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        (**self).claim_due(cutoffs, limit).await
    }

    async fn resolve(
        &self,
        id: EventId,
        attempt: u32,
        resolution: &AttemptResolution,
    ) -> Result<EventRecord, StoreError> {
        (**self).resolve(id, attempt, resolution).await
    }

    async fn requeue(&self, id: EventId) -> Result<EventRecord, StoreError> {
        (**self).requeue(id).await
    }

    async fn append_log(&self, log: HandlerExecutionLog) -> Result<(), StoreError> {
        (**self).append_log(log).await
    }
}

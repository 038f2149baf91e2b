//! The bus event record and its status machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketflow_core::{DomainError, EventId};

/// Processing status of a bus event.
///
/// ```text
/// pending ─► processing ─► completed
///                 │
///                 ├─► failed ─► processing ─► ...
///                 └─► max_retries_exceeded
/// ```
///
/// `completed` and `max_retries_exceeded` are absorbing for automatic
/// transitions. Only an operator (re-ingestion or requeue) moves a
/// dead-lettered event again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Stored, not yet picked up by a dispatcher.
    Pending,
    /// Claimed by exactly one dispatcher.
    Processing,
    /// Every registered handler succeeded.
    Completed,
    /// At least one handler failed; a retry is scheduled.
    Failed,
    /// Retry budget exhausted; waits for an operator.
    MaxRetriesExceeded,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Completed,
        EventStatus::Failed,
        EventStatus::MaxRetriesExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }

    /// No automatic transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::MaxRetriesExceeded)
    }
}

impl core::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown event status: {s}")))
    }
}

/// Deterministic deduplication key for a logical event.
pub fn idempotency_key(event_type: &str, aggregate_id: &str) -> String {
    format!("{event_type}:{aggregate_id}")
}

/// Aggregate type implied by an event type (`"order.created"` → `"order"`).
pub fn default_aggregate_type(event_type: &str) -> &str {
    event_type
        .split_once('.')
        .map(|(prefix, _)| prefix)
        .unwrap_or(event_type)
}

/// A validated event that is about to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub store_id: Option<String>,
    pub payload: JsonValue,
    pub max_retries: u32,
}

impl NewEvent {
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.event_type, &self.aggregate_id)
    }

    /// Materialize the stored row for a first insert.
    pub fn into_record(self, id: EventId, created_at: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id,
            idempotency_key: self.idempotency_key(),
            event_type: self.event_type,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            store_id: self.store_id,
            payload: self.payload,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            attempts: 0,
            claimed_at: None,
            next_retry_at: None,
            error_message: None,
            processed_at: None,
            created_at,
        }
    }
}

/// A stored bus event: the unit of work and the source of truth for its own
/// retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub idempotency_key: String,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub store_id: Option<String>,
    pub payload: JsonValue,
    pub status: EventStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Dispatch runs ever started. Bumped by every claim, never reset, so it
    /// numbers handler log rows across requeues.
    pub attempts: u32,
    /// Start of the current claim. Only set while `status == Processing`.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Only set while `status == Failed`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Only set once `status == Completed`.
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Whether the retry sweep should pick this event up at `now`.
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Whether a `pending` event was created at or before `cutoff` and so
    /// was never picked up by the caller that ingested it.
    pub fn is_orphaned(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.created_at <= cutoff
    }

    /// Whether a `processing` claim started at or before `cutoff`, meaning
    /// its worker is presumed gone. Rows claimed before `claimed_at` was
    /// tracked fall back to `created_at`.
    pub fn is_claim_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == EventStatus::Processing
            && self.claimed_at.unwrap_or(self.created_at) <= cutoff
    }

    /// Flip to `processing` for a new dispatch run starting at `now`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.claimed_at = Some(now);
        self.next_retry_at = None;
    }

    /// Reset the retry budget so an operator can replay the event.
    pub fn reset_for_requeue(&mut self) {
        self.status = EventStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.error_message = None;
    }

    /// Apply the outcome of a finished dispatch attempt.
    pub fn apply_resolution(&mut self, resolution: &AttemptResolution) {
        self.claimed_at = None;
        match resolution {
            AttemptResolution::Completed { processed_at } => {
                self.status = EventStatus::Completed;
                self.processed_at = Some(*processed_at);
                self.next_retry_at = None;
                self.error_message = None;
            }
            AttemptResolution::RetryScheduled {
                retry_count,
                next_retry_at,
                error,
            } => {
                self.status = EventStatus::Failed;
                self.retry_count = *retry_count;
                self.next_retry_at = Some(*next_retry_at);
                self.error_message = Some(error.clone());
            }
            AttemptResolution::DeadLettered { retry_count, error } => {
                self.status = EventStatus::MaxRetriesExceeded;
                self.retry_count = *retry_count;
                self.next_retry_at = None;
                self.error_message = Some(error.clone());
            }
        }
    }
}

/// Final state of one dispatch attempt, as written back to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptResolution {
    Completed {
        processed_at: DateTime<Utc>,
    },
    RetryScheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    DeadLettered {
        retry_count: u32,
        error: String,
    },
}

impl AttemptResolution {
    pub fn status(&self) -> EventStatus {
        match self {
            AttemptResolution::Completed { .. } => EventStatus::Completed,
            AttemptResolution::RetryScheduled { .. } => EventStatus::Failed,
            AttemptResolution::DeadLettered { .. } => EventStatus::MaxRetriesExceeded,
        }
    }
}

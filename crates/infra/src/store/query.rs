//! Read-side queries for operators.
//!
//! Paginated by default; nothing here mutates state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketflow_core::EventId;
use marketflow_events::{EventRecord, EventStatus, HandlerExecutionLog};

use super::r#trait::StoreError;

/// Pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter for event listings. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub event_type: Option<String>,
    pub store_id: Option<String>,
    pub aggregate_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn with_status(status: EventStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        self.status.is_none_or(|s| event.status == s)
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| event.event_type == t)
            && self
                .store_id
                .as_deref()
                .is_none_or(|s| event.store_id.as_deref() == Some(s))
            && self
                .aggregate_id
                .as_deref()
                .is_none_or(|a| event.aggregate_id == a)
            && self.created_after.is_none_or(|after| event.created_at >= after)
    }
}

/// One page of events, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<EventRecord>,
    /// Matches across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl EventPage {
    pub fn new(events: Vec<EventRecord>, total: u64, pagination: Pagination) -> Self {
        let has_more = u64::from(pagination.offset) + (events.len() as u64) < total;
        Self {
            events,
            total,
            pagination,
            has_more,
        }
    }
}

/// Event counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub max_retries_exceeded: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EventStatus, n: u64) {
        let slot = match status {
            EventStatus::Pending => &mut self.pending,
            EventStatus::Processing => &mut self.processing,
            EventStatus::Completed => &mut self.completed,
            EventStatus::Failed => &mut self.failed,
            EventStatus::MaxRetriesExceeded => &mut self.max_retries_exceeded,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.max_retries_exceeded
    }
}

/// Aggregated execution history of one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerStats {
    pub handler_name: String,
    pub runs: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
}

/// Read-only query interface.
#[async_trait::async_trait]
pub trait EventQuery: Send + Sync {
    /// Events matching `filter`, ordered by `created_at` descending.
    async fn list_events(
        &self,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError>;

    async fn get_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError>;

    /// Every handler run recorded for `event_id`, in execution order
    /// (attempt, then position).
    async fn logs_for_event(&self, event_id: EventId)
    -> Result<Vec<HandlerExecutionLog>, StoreError>;

    /// Events per status, optionally limited to events created since `since`.
    async fn status_counts(&self, since: Option<DateTime<Utc>>)
    -> Result<StatusCounts, StoreError>;

    /// Per-handler run statistics, optionally limited to runs since `since`.
    /// Sorted by handler name.
    async fn handler_stats(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HandlerStats>, StoreError>;
}

#[async_trait::async_trait]
impl<Q> EventQuery for Arc<Q>
where
    Q: EventQuery + ?Sized,
{
    async fn list_events(
        &self,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError> {
        (**self).list_events(filter, pagination).await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        (**self).get_event(id).await
    }

    async fn logs_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<HandlerExecutionLog>, StoreError> {
        (**self).logs_for_event(event_id).await
    }

    async fn status_counts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<StatusCounts, StoreError> {
        (**self).status_counts(since).await
    }

    async fn handler_stats(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HandlerStats>, StoreError> {
        (**self).handler_stats(since).await
    }
}

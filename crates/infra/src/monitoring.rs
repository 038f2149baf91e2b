//! Read-only operator views over events and handler history.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use marketflow_core::{Clock, EventId};
use marketflow_events::{EventRecord, EventStatus, HandlerExecutionLog};

use crate::store::{
    EventFilter, EventPage, EventQuery, HandlerStats, Pagination, StatusCounts, StoreError,
};

/// Bus health over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub window_hours: i64,
    pub window_start: DateTime<Utc>,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub pending: u64,
    pub processing: u64,
    /// `completed / total`, as a percentage. 100 when the window is empty.
    pub success_rate_pct: f64,
    /// `(failed + dead_lettered) / total`, as a percentage.
    pub failure_rate_pct: f64,
    /// Mean over every handler run in the window.
    pub avg_handler_latency_ms: f64,
    pub handler_runs: u64,
    pub handlers: Vec<HandlerStats>,
}

/// One dead-lettered event, as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_id: String,
    pub store_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<EventRecord> for DeadLetter {
    fn from(event: EventRecord) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type,
            aggregate_id: event.aggregate_id,
            store_id: event.store_id,
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            error_message: event.error_message,
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterPage {
    pub dead_letters: Vec<DeadLetter>,
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// An event with its full handler history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDetail {
    pub event: EventRecord,
    pub logs: Vec<HandlerExecutionLog>,
}

pub struct BusMonitor<Q> {
    query: Q,
    clock: Arc<dyn Clock>,
}

impl<Q: EventQuery> BusMonitor<Q> {
    pub fn new(query: Q, clock: Arc<dyn Clock>) -> Self {
        Self { query, clock }
    }

    pub async fn list_events(
        &self,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError> {
        self.query.list_events(filter, pagination).await
    }

    pub async fn event_detail(&self, id: EventId) -> Result<Option<EventDetail>, StoreError> {
        let Some(event) = self.query.get_event(id).await? else {
            return Ok(None);
        };
        let logs = self.query.logs_for_event(id).await?;
        Ok(Some(EventDetail { event, logs }))
    }

    pub async fn dead_letters(&self, pagination: Pagination) -> Result<DeadLetterPage, StoreError> {
        let page = self
            .query
            .list_events(EventFilter::with_status(EventStatus::MaxRetriesExceeded), pagination)
            .await?;

        Ok(DeadLetterPage {
            dead_letters: page.events.into_iter().map(DeadLetter::from).collect(),
            total: page.total,
            pagination: page.pagination,
            has_more: page.has_more,
        })
    }

    /// Status counts, over the trailing `window` when given.
    pub async fn status_counts(
        &self,
        window: Option<Duration>,
    ) -> Result<StatusCounts, StoreError> {
        let since = window.map(|w| self.window_start(w));
        self.query.status_counts(since).await
    }

    pub async fn health(&self, window: Duration) -> Result<HealthReport, StoreError> {
        let window_start = self.window_start(window);
        let counts = self.query.status_counts(Some(window_start)).await?;
        let handlers = self.query.handler_stats(Some(window_start)).await?;

        let total = counts.total();
        let handler_runs: u64 = handlers.iter().map(|h| h.runs).sum();
        let weighted_ms: f64 = handlers
            .iter()
            .map(|h| h.avg_duration_ms * h.runs as f64)
            .sum();

        Ok(HealthReport {
            window_hours: window.num_hours(),
            window_start,
            total,
            completed: counts.completed,
            failed: counts.failed,
            dead_lettered: counts.max_retries_exceeded,
            pending: counts.pending,
            processing: counts.processing,
            success_rate_pct: if total == 0 {
                100.0
            } else {
                percentage(counts.completed, total)
            },
            failure_rate_pct: percentage(counts.failed + counts.max_retries_exceeded, total),
            avg_handler_latency_ms: if handler_runs == 0 {
                0.0
            } else {
                round2(weighted_ms / handler_runs as f64)
            },
            handler_runs,
            handlers,
        })
    }

    fn window_start(&self, window: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / total as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{LogId, ManualClock};
    use marketflow_events::{AttemptResolution, HandlerRunStatus, NewEvent};

    use crate::store::{EventStore, InMemoryEventStore};

    fn new_event(aggregate_id: &str) -> NewEvent {
        NewEvent {
            event_type: "order.created".to_string(),
            aggregate_type: "order".to_string(),
            aggregate_id: aggregate_id.to_string(),
            store_id: Some("store_1".to_string()),
            payload: serde_json::json!({}),
            max_retries: 1,
        }
    }

    async fn finish(store: &InMemoryEventStore, id: EventId, resolution: AttemptResolution) {
        store
            .claim(id, &[EventStatus::Pending], Utc::now())
            .await
            .unwrap();
        store.resolve(id, 1, &resolution).await.unwrap();
    }

    fn run(
        event_id: EventId,
        handler: &str,
        ms: u64,
        ok: bool,
        at: DateTime<Utc>,
    ) -> HandlerExecutionLog {
        HandlerExecutionLog {
            id: LogId::new(),
            event_id,
            handler_name: handler.to_string(),
            attempt: 1,
            position: 0,
            status: if ok { HandlerRunStatus::Success } else { HandlerRunStatus::Failed },
            duration_ms: ms,
            error_message: (!ok).then(|| "boom".to_string()),
            created_at: at,
        }
    }

    #[tokio::test]
    async fn health_reports_rates_and_latency_over_the_window() {
        let now = Utc::now();
        let store = Arc::new(InMemoryEventStore::new());
        let monitor = BusMonitor::new(store.clone(), Arc::new(ManualClock::new(now)));

        let old = store
            .insert_or_get(new_event("old"), now - Duration::days(3))
            .await
            .unwrap()
            .record
            .id;
        let ok = store.insert_or_get(new_event("ok"), now).await.unwrap().record.id;
        let dead = store.insert_or_get(new_event("dead"), now).await.unwrap().record.id;
        store.insert_or_get(new_event("waiting"), now).await.unwrap();

        finish(&store, old, AttemptResolution::Completed { processed_at: now }).await;
        finish(&store, ok, AttemptResolution::Completed { processed_at: now }).await;
        finish(
            &store,
            dead,
            AttemptResolution::DeadLettered {
                retry_count: 1,
                error: "escrow: boom".to_string(),
            },
        )
        .await;

        store
            .append_log(run(old, "create_escrow", 500, true, now - Duration::days(3)))
            .await
            .unwrap();
        store.append_log(run(ok, "create_escrow", 10, true, now)).await.unwrap();
        store.append_log(run(dead, "create_escrow", 30, false, now)).await.unwrap();
        store.append_log(run(ok, "notify_store", 20, true, now)).await.unwrap();

        let report = monitor.health(Duration::hours(24)).await.unwrap();

        assert_eq!(report.window_hours, 24);
        assert_eq!(report.total, 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(report.success_rate_pct, 33.33);
        assert_eq!(report.failure_rate_pct, 33.33);
        assert_eq!(report.handler_runs, 3);
        assert_eq!(report.avg_handler_latency_ms, 20.0);
        assert_eq!(report.handlers[0].handler_name, "create_escrow");
        assert_eq!(report.handlers[0].failures, 1);

        let all_time = monitor.status_counts(None).await.unwrap();
        assert_eq!(all_time.completed, 2);
    }

    #[tokio::test]
    async fn empty_window_is_healthy() {
        let monitor = BusMonitor::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(ManualClock::default()),
        );
        let report = monitor.health(Duration::hours(1)).await.unwrap();

        assert_eq!(report.total, 0);
        assert_eq!(report.success_rate_pct, 100.0);
        assert_eq!(report.failure_rate_pct, 0.0);
        assert_eq!(report.avg_handler_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn dead_letters_and_detail() {
        let store = Arc::new(InMemoryEventStore::new());
        let monitor = BusMonitor::new(store.clone(), Arc::new(ManualClock::default()));
        let now = Utc::now();

        let dead = store.insert_or_get(new_event("ord_3"), now).await.unwrap().record.id;
        finish(
            &store,
            dead,
            AttemptResolution::DeadLettered {
                retry_count: 1,
                error: "payout: gateway down".to_string(),
            },
        )
        .await;
        store.append_log(run(dead, "process_payout", 5, false, now)).await.unwrap();

        let page = monitor.dead_letters(Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.dead_letters[0].aggregate_id, "ord_3");
        assert_eq!(
            page.dead_letters[0].error_message.as_deref(),
            Some("payout: gateway down")
        );

        let detail = monitor.event_detail(dead).await.unwrap().unwrap();
        assert_eq!(detail.logs.len(), 1);
        assert!(monitor.event_detail(EventId::new()).await.unwrap().is_none());
    }
}

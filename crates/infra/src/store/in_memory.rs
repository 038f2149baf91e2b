//! In-memory event store for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use marketflow_core::{EventId, LogId};
use marketflow_events::{
    AttemptResolution, EventRecord, EventStatus, HandlerExecutionLog, NewEvent,
};

use super::query::{EventFilter, EventPage, EventQuery, HandlerStats, Pagination, StatusCounts};
use super::r#trait::{Claim, EventStore, InsertOutcome, StoreError, SweepCutoffs};

#[derive(Debug, Default)]
struct Tables {
    events: HashMap<EventId, EventRecord>,
    by_key: HashMap<String, EventId>,
    logs: Vec<HandlerExecutionLog>,
    log_ids: HashSet<LogId>,
}

/// In-memory [`EventStore`] + [`EventQuery`].
///
/// A single `RwLock` guards all tables, so each conditional transition is
/// atomic with respect to every other caller.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    tables: RwLock<Tables>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("event store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("event store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert_or_get(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.write()?;
        let key = event.idempotency_key();

        if let Some(existing) = tables.by_key.get(&key).and_then(|id| tables.events.get(id)) {
            return Ok(InsertOutcome {
                record: existing.clone(),
                created: false,
            });
        }

        let record = event.into_record(EventId::new(), now);
        tables.by_key.insert(key, record.id);
        tables.events.insert(record.id, record.clone());

        Ok(InsertOutcome {
            record,
            created: true,
        })
    }

    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.read()?.events.get(&id).cloned())
    }

    async fn claim(
        &self,
        id: EventId,
        from: &[EventStatus],
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        let mut tables = self.write()?;
        let event = tables.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !from.contains(&event.status) {
            return Ok(Claim::Held(event.status));
        }

        event.mark_processing(now);
        Ok(Claim::Claimed(event.clone()))
    }

    async fn claim_due(
        &self,
        cutoffs: SweepCutoffs,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut tables = self.write()?;

        let mut due: Vec<(DateTime<Utc>, EventId)> = tables
            .events
            .values()
            .filter(|e| {
                e.is_due_for_retry(cutoffs.now)
                    || e.is_orphaned(cutoffs.orphaned_before)
                    || e.is_claim_expired(cutoffs.lease_expired_before)
            })
            .map(|e| (e.created_at, e.id))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(event) = tables.events.get_mut(&id) {
                event.mark_processing(cutoffs.now);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn resolve(
        &self,
        id: EventId,
        attempt: u32,
        resolution: &AttemptResolution,
    ) -> Result<EventRecord, StoreError> {
        let mut tables = self.write()?;
        let event = tables.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if event.status != EventStatus::Processing {
            return Err(StoreError::InvalidTransition {
                id,
                status: event.status,
            });
        }
        if event.attempts != attempt {
            return Err(StoreError::ClaimLost { id, attempt });
        }

        event.apply_resolution(resolution);
        Ok(event.clone())
    }

    async fn requeue(&self, id: EventId) -> Result<EventRecord, StoreError> {
        let mut tables = self.write()?;
        let event = tables.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !matches!(
            event.status,
            EventStatus::Failed | EventStatus::MaxRetriesExceeded
        ) {
            return Err(StoreError::InvalidTransition {
                id,
                status: event.status,
            });
        }

        event.reset_for_requeue();
        Ok(event.clone())
    }

    async fn append_log(&self, log: HandlerExecutionLog) -> Result<(), StoreError> {
        let mut tables = self.write()?;

        if !tables.events.contains_key(&log.event_id) {
            return Err(StoreError::Integrity(format!(
                "log row references unknown event {}",
                log.event_id
            )));
        }
        if !tables.log_ids.insert(log.id) {
            return Err(StoreError::Integrity(format!(
                "log row {} already exists",
                log.id
            )));
        }

        tables.logs.push(log);
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventQuery for InMemoryEventStore {
    async fn list_events(
        &self,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError> {
        let tables = self.read()?;

        let mut matching: Vec<&EventRecord> =
            tables.events.values().filter(|e| filter.matches(e)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let events = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();

        Ok(EventPage::new(events, total, pagination))
    }

    async fn get_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.read()?.events.get(&id).cloned())
    }

    async fn logs_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<HandlerExecutionLog>, StoreError> {
        let tables = self.read()?;
        let mut logs: Vec<_> = tables
            .logs
            .iter()
            .filter(|l| l.event_id == event_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| (l.attempt, l.position, l.created_at));
        Ok(logs)
    }

    async fn status_counts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<StatusCounts, StoreError> {
        let tables = self.read()?;
        let mut counts = StatusCounts::default();
        for event in tables.events.values() {
            if since.is_none_or(|s| event.created_at >= s) {
                counts.add(event.status, 1);
            }
        }
        Ok(counts)
    }

    async fn handler_stats(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HandlerStats>, StoreError> {
        let tables = self.read()?;

        // name -> (runs, failures, total_ms, max_ms)
        let mut acc: BTreeMap<&str, (u64, u64, u64, u64)> = BTreeMap::new();
        for log in tables
            .logs
            .iter()
            .filter(|l| since.is_none_or(|s| l.created_at >= s))
        {
            let entry = acc.entry(log.handler_name.as_str()).or_default();
            entry.0 += 1;
            if !log.is_success() {
                entry.1 += 1;
            }
            entry.2 += log.duration_ms;
            entry.3 = entry.3.max(log.duration_ms);
        }

        Ok(acc
            .into_iter()
            .map(|(name, (runs, failures, total_ms, max_ms))| HandlerStats {
                handler_name: name.to_string(),
                runs,
                failures,
                avg_duration_ms: total_ms as f64 / runs as f64,
                max_duration_ms: max_ms,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use marketflow_events::HandlerRunStatus;
    use proptest::prelude::*;

    fn new_event(event_type: &str, aggregate_id: &str) -> NewEvent {
        NewEvent {
            event_type: event_type.to_string(),
            aggregate_type: "order".to_string(),
            aggregate_id: aggregate_id.to_string(),
            store_id: Some("store_1".to_string()),
            payload: serde_json::json!({}),
            max_retries: 3,
        }
    }

    fn log(
        event_id: EventId,
        name: &str,
        attempt: u32,
        status: HandlerRunStatus,
    ) -> HandlerExecutionLog {
        HandlerExecutionLog {
            id: LogId::new(),
            event_id,
            handler_name: name.to_string(),
            attempt,
            position: 0,
            status,
            duration_ms: 10 * u64::from(attempt),
            error_message: None,
            created_at: Utc::now(),
        }
    }

    fn cutoffs(now: DateTime<Utc>) -> SweepCutoffs {
        SweepCutoffs {
            now,
            orphaned_before: now - Duration::minutes(2),
            lease_expired_before: now - Duration::minutes(10),
        }
    }

    async fn seed(store: &InMemoryEventStore, aggregate_id: &str, at: DateTime<Utc>) -> EventId {
        store
            .insert_or_get(new_event("order.created", aggregate_id), at)
            .await
            .unwrap()
            .record
            .id
    }

    #[tokio::test]
    async fn same_key_returns_existing_row() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();

        let first = store.insert_or_get(new_event("order.created", "o1"), now).await.unwrap();
        let second = store.insert_or_get(new_event("order.created", "o1"), now).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.record.id, second.record.id);

        let page = store
            .list_events(EventFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn only_one_claim_wins() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let id = seed(&store, "o1", now).await;

        let first = store.claim(id, &[EventStatus::Pending], now).await.unwrap();
        let second = store.claim(id, &[EventStatus::Pending], now).await.unwrap();

        match first {
            Claim::Claimed(e) => {
                assert_eq!(e.status, EventStatus::Processing);
                assert_eq!(e.attempts, 1);
                assert_eq!(e.claimed_at, Some(now));
            }
            Claim::Held(status) => panic!("expected a claim, got {status}"),
        }
        assert_eq!(second, Claim::Held(EventStatus::Processing));

        let missing = EventId::new();
        assert_eq!(
            store.claim(missing, &[EventStatus::Pending], now).await,
            Err(StoreError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn resolve_requires_processing_under_the_same_run() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let id = seed(&store, "o1", now).await;
        let done = AttemptResolution::Completed { processed_at: now };

        let err = store.resolve(id, 1, &done).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                id,
                status: EventStatus::Pending
            }
        );

        store.claim(id, &[EventStatus::Pending], now).await.unwrap();
        assert_eq!(
            store.resolve(id, 2, &done).await,
            Err(StoreError::ClaimLost { id, attempt: 2 })
        );

        let resolved = store.resolve(id, 1, &done).await.unwrap();
        assert_eq!(resolved.status, EventStatus::Completed);
        assert!(resolved.claimed_at.is_none());
    }

    #[tokio::test]
    async fn claim_due_picks_due_retries_orphans_and_expired_leases() {
        let store = InMemoryEventStore::new();
        let start = Utc::now();

        let due = seed(&store, "due", start).await;
        let later = seed(&store, "later", start).await;
        let orphan = seed(&store, "orphan", start - Duration::minutes(10)).await;
        let fresh = seed(&store, "fresh", start).await;
        let stuck = seed(&store, "stuck", start - Duration::minutes(30)).await;
        let busy = seed(&store, "busy", start - Duration::minutes(20)).await;

        for (id, at) in [
            (due, start - Duration::seconds(1)),
            (later, start + Duration::hours(1)),
        ] {
            store.claim(id, &[EventStatus::Pending], start).await.unwrap();
            store
                .resolve(
                    id,
                    1,
                    &AttemptResolution::RetryScheduled {
                        retry_count: 1,
                        next_retry_at: at,
                        error: "boom".to_string(),
                    },
                )
                .await
                .unwrap();
        }
        store
            .claim(stuck, &[EventStatus::Pending], start - Duration::minutes(15))
            .await
            .unwrap();
        store
            .claim(busy, &[EventStatus::Pending], start - Duration::minutes(1))
            .await
            .unwrap();

        let claimed = store.claim_due(cutoffs(start), 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.id).collect();

        assert_eq!(ids, vec![stuck, orphan, due]);
        assert!(claimed.iter().all(|e| e.status == EventStatus::Processing));
        assert!(claimed.iter().all(|e| e.claimed_at == Some(start)));
        assert_eq!(claimed[0].attempts, 2);
        assert_eq!(store.get(fresh).await.unwrap().unwrap().status, EventStatus::Pending);
        assert_eq!(store.get(later).await.unwrap().unwrap().status, EventStatus::Failed);
        assert_eq!(store.get(busy).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn requeue_resets_budget_for_dead_letters_only() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let id = seed(&store, "o1", now).await;

        assert!(matches!(
            store.requeue(id).await,
            Err(StoreError::InvalidTransition { status: EventStatus::Pending, .. })
        ));

        store.claim(id, &[EventStatus::Pending], now).await.unwrap();
        store
            .resolve(
                id,
                1,
                &AttemptResolution::DeadLettered {
                    retry_count: 3,
                    error: "gone".to_string(),
                },
            )
            .await
            .unwrap();

        let requeued = store.requeue(id).await.unwrap();
        assert_eq!(requeued.status, EventStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.attempts, 1);
        assert!(requeued.error_message.is_none());
    }

    #[tokio::test]
    async fn logs_are_append_only_and_aggregated_per_handler() {
        let store = InMemoryEventStore::new();
        let id = seed(&store, "o1", Utc::now()).await;

        let row = log(id, "audit_log", 1, HandlerRunStatus::Failed);
        store.append_log(row.clone()).await.unwrap();
        store
            .append_log(log(id, "audit_log", 2, HandlerRunStatus::Success))
            .await
            .unwrap();
        store
            .append_log(log(id, "notify_store", 1, HandlerRunStatus::Success))
            .await
            .unwrap();

        assert!(matches!(store.append_log(row).await, Err(StoreError::Integrity(_))));
        assert!(matches!(
            store
                .append_log(log(EventId::new(), "audit_log", 1, HandlerRunStatus::Success))
                .await,
            Err(StoreError::Integrity(_))
        ));

        let stats = store.handler_stats(None).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].handler_name, "audit_log");
        assert_eq!(stats[0].runs, 2);
        assert_eq!(stats[0].failures, 1);
        assert_eq!(stats[0].avg_duration_ms, 15.0);
        assert_eq!(stats[0].max_duration_ms, 20);

        let attempts: Vec<_> = store
            .logs_for_event(id)
            .await
            .unwrap()
            .iter()
            .map(|l| l.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn list_filters_and_counts() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert_or_get(new_event("order.created", "o1"), now).await.unwrap();
        store.insert_or_get(new_event("order.created", "o2"), now).await.unwrap();
        store.insert_or_get(new_event("payment.paid", "o1"), now).await.unwrap();

        let filter = EventFilter {
            event_type: Some("order.created".to_string()),
            ..Default::default()
        };
        let page = store
            .list_events(filter, Pagination::new(Some(1), None))
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.events.len(), 1);
        assert!(page.has_more);

        let counts = store.status_counts(Some(now - Duration::hours(1))).await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.total(), 3);
    }

    // ─────────────────────────────────────────────────────────────────────
    // State machine properties
    // ─────────────────────────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    enum Step {
        Advance(i64),
        Claim,
        Sweep,
        Complete,
        Retry,
        DeadLetter,
        ResolveStale,
        Requeue,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1i64..30).prop_map(Step::Advance),
            Just(Step::Claim),
            Just(Step::Sweep),
            Just(Step::Complete),
            Just(Step::Retry),
            Just(Step::DeadLetter),
            Just(Step::ResolveStale),
            Just(Step::Requeue),
        ]
    }

    async fn run_steps(steps: Vec<Step>) -> Result<(), TestCaseError> {
        let store = InMemoryEventStore::new();
        let mut now = Utc::now();
        let id = seed(&store, "o1", now).await;
        let mut runs = 0u32;

        for step in steps {
            let before = store.get(id).await.unwrap().unwrap();
            let attempt = before.attempts;

            match step {
                Step::Advance(minutes) => now += Duration::minutes(minutes),
                Step::Claim => {
                    let from = [
                        EventStatus::Pending,
                        EventStatus::Failed,
                        EventStatus::MaxRetriesExceeded,
                    ];
                    if let Claim::Claimed(_) = store.claim(id, &from, now).await.unwrap() {
                        runs += 1;
                    }
                }
                Step::Sweep => {
                    runs += store.claim_due(cutoffs(now), 10).await.unwrap().len() as u32;
                }
                Step::Complete => {
                    let done = AttemptResolution::Completed { processed_at: now };
                    let _ = store.resolve(id, attempt, &done).await;
                }
                Step::Retry => {
                    let retry = AttemptResolution::RetryScheduled {
                        retry_count: before.retry_count + 1,
                        next_retry_at: now + Duration::minutes(5),
                        error: "boom".to_string(),
                    };
                    let _ = store.resolve(id, attempt, &retry).await;
                }
                Step::DeadLetter => {
                    let dead = AttemptResolution::DeadLettered {
                        retry_count: before.retry_count + 1,
                        error: "gone".to_string(),
                    };
                    let _ = store.resolve(id, attempt, &dead).await;
                }
                Step::ResolveStale => {
                    let done = AttemptResolution::Completed { processed_at: now };
                    let stale = store.resolve(id, attempt.wrapping_sub(1), &done).await;
                    prop_assert!(stale.is_err());
                }
                Step::Requeue => {
                    let _ = store.requeue(id).await;
                }
            }

            let after = store.get(id).await.unwrap().unwrap();
            prop_assert!(after.attempts >= before.attempts);
            prop_assert_eq!(after.attempts, runs);
            prop_assert_eq!(
                after.status == EventStatus::Processing,
                after.claimed_at.is_some()
            );
            if before.status == EventStatus::Completed {
                prop_assert_eq!(&after, &before);
            }
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn run_counter_and_claim_stamp_stay_consistent(
            steps in proptest::collection::vec(step(), 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(run_steps(steps))?;
        }
    }
}

//! Postgres-backed event store.
//!
//! Every status transition is a single `UPDATE ... WHERE status = ...
//! RETURNING`, so the row's current status is the lock: a transition that
//! lost a race simply updates nothing.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Integrity` |
//! | Database (foreign key violation) | `23503` | `Integrity` |
//! | Database (check / raise exception) | `23514`, `P0001` | `Integrity` |
//! | anything else | | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use marketflow_core::{EventId, LogId};
use marketflow_events::{
    AttemptResolution, EventRecord, EventStatus, HandlerExecutionLog, HandlerRunStatus, NewEvent,
};

use super::query::{EventFilter, EventPage, EventQuery, HandlerStats, Pagination, StatusCounts};
use super::r#trait::{Claim, EventStore, InsertOutcome, StoreError, SweepCutoffs};

const MIGRATIONS: [(&str, &str); 2] = [
    (
        "0001_event_bus",
        include_str!("../../migrations/0001_event_bus.sql"),
    ),
    (
        "0002_claim_lease",
        include_str!("../../migrations/0002_claim_lease.sql"),
    ),
];

const EVENT_COLUMNS: &str = r#"
    id, idempotency_key, event_type, aggregate_type, aggregate_id, store_id,
    payload, status, retry_count, max_retries, attempts, claimed_at,
    next_retry_at, error_message, processed_at, created_at
"#;

const LIST_WHERE: &str = r#"
    WHERE ($1::text IS NULL OR status = $1)
      AND ($2::text IS NULL OR event_type = $2)
      AND ($3::text IS NULL OR store_id = $3)
      AND ($4::text IS NULL OR aggregate_id = $4)
      AND ($5::timestamptz IS NULL OR created_at >= $5)
"#;

/// Postgres [`EventStore`] + [`EventQuery`].
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables, columns, indexes and the append-only trigger if
    /// missing. Every migration is idempotent, so this runs on each start.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(name, e))?;
        }
        Ok(())
    }

    async fn fetch_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_event(&r)).transpose()
    }

    /// Explain why a conditional update touched no row.
    async fn transition_failure(&self, id: EventId) -> StoreError {
        match self.fetch_event(id).await {
            Ok(Some(event)) => StoreError::InvalidTransition {
                id,
                status: event.status,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }

    /// Explain why a fenced resolve touched no row.
    async fn resolve_failure(&self, id: EventId, attempt: u32) -> StoreError {
        match self.fetch_event(id).await {
            Ok(Some(event)) if event.status == EventStatus::Processing => {
                StoreError::ClaimLost { id, attempt }
            }
            Ok(Some(event)) => StoreError::InvalidTransition {
                id,
                status: event.status,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, event, now),
        fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id),
        err
    )]
    async fn insert_or_get(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let key = event.idempotency_key();
        let sql = format!(
            r#"
            INSERT INTO events (
                id, idempotency_key, event_type, aggregate_type, aggregate_id,
                store_id, payload, status, retry_count, max_retries, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        );

        let inserted = sqlx::query(&sql)
            .bind(Uuid::from(EventId::new()))
            .bind(&key)
            .bind(&event.event_type)
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(event.store_id.as_deref())
            .bind(&event.payload)
            .bind(to_i32(event.max_retries))
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_or_get", e))?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome {
                record: decode_event(&row)?,
                created: true,
            });
        }

        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE idempotency_key = $1");
        let existing = sqlx::query(&sql)
            .bind(&key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_or_get", e))?
            .ok_or_else(|| {
                StoreError::Storage(format!("conflicting row for `{key}` disappeared"))
            })?;

        Ok(InsertOutcome {
            record: decode_event(&existing)?,
            created: false,
        })
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        self.fetch_event(id).await
    }

    #[instrument(skip(self, from, now), fields(event_id = %id), err)]
    async fn claim(
        &self,
        id: EventId,
        from: &[EventStatus],
        now: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            UPDATE events
            SET status = 'processing',
                attempts = attempts + 1,
                claimed_at = $3,
                next_retry_at = NULL
            WHERE id = $1 AND status = ANY($2)
            RETURNING {EVENT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(&from)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        match row {
            Some(row) => Ok(Claim::Claimed(decode_event(&row)?)),
            None => match self.fetch_event(id).await? {
                Some(event) => Ok(Claim::Held(event.status)),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        cutoffs: SweepCutoffs,
        limit: u32,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let sql = format!(
            r#"
            UPDATE events
            SET status = 'processing',
                attempts = attempts + 1,
                claimed_at = $1,
                next_retry_at = NULL
            WHERE id IN (
                SELECT id FROM events
                WHERE (status = 'failed' AND next_retry_at <= $1)
                   OR (status = 'pending' AND created_at <= $2)
                   OR (status = 'processing' AND COALESCE(claimed_at, created_at) <= $3)
                ORDER BY created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(cutoffs.now)
            .bind(cutoffs.orphaned_before)
            .bind(cutoffs.lease_expired_before)
            .bind(i64::from(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut claimed = rows
            .iter()
            .map(decode_event)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|e| (e.created_at, e.id));
        Ok(claimed)
    }

    #[instrument(
        skip(self, resolution),
        fields(event_id = %id, status = %resolution.status()),
        err
    )]
    async fn resolve(
        &self,
        id: EventId,
        attempt: u32,
        resolution: &AttemptResolution,
    ) -> Result<EventRecord, StoreError> {
        let (retry_count, next_retry_at, error, processed_at) = match resolution {
            AttemptResolution::Completed { processed_at } => {
                (None, None, None, Some(*processed_at))
            }
            AttemptResolution::RetryScheduled {
                retry_count,
                next_retry_at,
                error,
            } => (
                Some(to_i32(*retry_count)),
                Some(*next_retry_at),
                Some(error.as_str()),
                None,
            ),
            AttemptResolution::DeadLettered { retry_count, error } => {
                (Some(to_i32(*retry_count)), None, Some(error.as_str()), None)
            }
        };

        let sql = format!(
            r#"
            UPDATE events
            SET status = $2,
                retry_count = COALESCE($3, retry_count),
                next_retry_at = $4,
                error_message = $5,
                processed_at = COALESCE($6, processed_at),
                claimed_at = NULL
            WHERE id = $1 AND status = 'processing' AND attempts = $7
            RETURNING {EVENT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(resolution.status().as_str())
            .bind(retry_count)
            .bind(next_retry_at)
            .bind(error)
            .bind(processed_at)
            .bind(to_i32(attempt))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("resolve", e))?;

        match row {
            Some(row) => decode_event(&row),
            None => Err(self.resolve_failure(id, attempt).await),
        }
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn requeue(&self, id: EventId) -> Result<EventRecord, StoreError> {
        let sql = format!(
            r#"
            UPDATE events
            SET status = 'pending', retry_count = 0, next_retry_at = NULL, error_message = NULL
            WHERE id = $1 AND status IN ('failed', 'max_retries_exceeded')
            RETURNING {EVENT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;

        match row {
            Some(row) => decode_event(&row),
            None => Err(self.transition_failure(id).await),
        }
    }

    #[instrument(
        skip(self, log),
        fields(event_id = %log.event_id, handler = %log.handler_name, attempt = log.attempt),
        err
    )]
    async fn append_log(&self, log: HandlerExecutionLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_handler_logs (
                id, event_id, handler_name, attempt, position, status,
                duration_ms, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.event_id.as_uuid())
        .bind(&log.handler_name)
        .bind(to_i32(log.attempt))
        .bind(to_i32(log.position))
        .bind(log.status.as_str())
        .bind(i64::try_from(log.duration_ms).unwrap_or(i64::MAX))
        .bind(log.error_message.as_deref())
        .bind(log.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl EventQuery for PostgresEventStore {
    #[instrument(skip(self), err)]
    async fn list_events(
        &self,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError> {
        let status = filter.status.map(|s| s.as_str());

        let count_sql = format!("SELECT COUNT(*) AS total FROM events {LIST_WHERE}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(status)
            .bind(filter.event_type.as_deref())
            .bind(filter.store_id.as_deref())
            .bind(filter.aggregate_id.as_deref())
            .bind(filter.created_after)
            .fetch_one(&*self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("list_events", e))?;

        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            {LIST_WHERE}
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(filter.event_type.as_deref())
            .bind(filter.store_id.as_deref())
            .bind(filter.aggregate_id.as_deref())
            .bind(filter.created_after)
            .bind(i64::from(pagination.limit))
            .bind(i64::from(pagination.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_events", e))?;

        let events = rows
            .iter()
            .map(decode_event)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventPage::new(events, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get_event(&self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        self.fetch_event(id).await
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn logs_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<HandlerExecutionLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, handler_name, attempt, position, status,
                   duration_ms, error_message, created_at
            FROM event_handler_logs
            WHERE event_id = $1
            ORDER BY attempt ASC, position ASC, created_at ASC
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs_for_event", e))?;

        rows.iter()
            .map(|row| {
                HandlerLogRow::from_row(row)
                    .map_err(|e| StoreError::Storage(format!("failed to decode log row: {e}")))
                    .and_then(HandlerExecutionLog::try_from)
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn status_counts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM events
            WHERE ($1::timestamptz IS NULL OR created_at >= $1)
            GROUP BY status
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("status_counts", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("status_counts", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("status_counts", e))?;
            counts.add(parse_status(&status)?, n.max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn handler_stats(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HandlerStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT handler_name,
                   COUNT(*) AS runs,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failures,
                   AVG(duration_ms)::float8 AS avg_duration_ms,
                   MAX(duration_ms) AS max_duration_ms
            FROM event_handler_logs
            WHERE ($1::timestamptz IS NULL OR created_at >= $1)
            GROUP BY handler_name
            ORDER BY handler_name ASC
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("handler_stats", e))?;

        rows.iter()
            .map(|row| {
                let stats = HandlerStatsRow::from_row(row)
                    .map_err(|e| map_sqlx_error("handler_stats", e))?;
                Ok(HandlerStats::from(stats))
            })
            .collect()
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn parse_status(raw: &str) -> Result<EventStatus, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Storage(format!("corrupt status column: {e}")))
}

fn decode_event(row: &PgRow) -> Result<EventRecord, StoreError> {
    EventRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to decode event row: {e}")))
        .and_then(EventRecord::try_from)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("23514") | Some("P0001") => {
                    StoreError::Integrity(msg)
                }
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct EventRow {
    id: Uuid,
    idempotency_key: String,
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    store_id: Option<String>,
    payload: serde_json::Value,
    status: String,
    retry_count: i32,
    max_retries: i32,
    attempts: i32,
    claimed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            event_type: row.try_get("event_type")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            store_id: row.try_get("store_id")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            attempts: row.try_get("attempts")?,
            claimed_at: row.try_get("claimed_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_message: row.try_get("error_message")?,
            processed_at: row.try_get("processed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventRecord {
            id: EventId::from_uuid(row.id),
            idempotency_key: row.idempotency_key,
            event_type: row.event_type,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            store_id: row.store_id,
            payload: row.payload,
            status: parse_status(&row.status)?,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            attempts: row.attempts.max(0) as u32,
            claimed_at: row.claimed_at,
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct HandlerLogRow {
    id: Uuid,
    event_id: Uuid,
    handler_name: String,
    attempt: i32,
    position: i32,
    status: String,
    duration_ms: i64,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for HandlerLogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HandlerLogRow {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            handler_name: row.try_get("handler_name")?,
            attempt: row.try_get("attempt")?,
            position: row.try_get("position")?,
            status: row.try_get("status")?,
            duration_ms: row.try_get("duration_ms")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<HandlerLogRow> for HandlerExecutionLog {
    type Error = StoreError;

    fn try_from(row: HandlerLogRow) -> Result<Self, Self::Error> {
        let status: HandlerRunStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Storage(format!("corrupt log status column: {e}")))?;

        Ok(HandlerExecutionLog {
            id: LogId::from_uuid(row.id),
            event_id: EventId::from_uuid(row.event_id),
            handler_name: row.handler_name,
            attempt: row.attempt.max(0) as u32,
            position: row.position.max(0) as u32,
            status,
            duration_ms: row.duration_ms.max(0) as u64,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct HandlerStatsRow {
    handler_name: String,
    runs: i64,
    failures: i64,
    avg_duration_ms: Option<f64>,
    max_duration_ms: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for HandlerStatsRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HandlerStatsRow {
            handler_name: row.try_get("handler_name")?,
            runs: row.try_get("runs")?,
            failures: row.try_get("failures")?,
            avg_duration_ms: row.try_get("avg_duration_ms")?,
            max_duration_ms: row.try_get("max_duration_ms")?,
        })
    }
}

impl From<HandlerStatsRow> for HandlerStats {
    fn from(row: HandlerStatsRow) -> Self {
        HandlerStats {
            handler_name: row.handler_name,
            runs: row.runs.max(0) as u64,
            failures: row.failures.max(0) as u64,
            avg_duration_ms: row.avg_duration_ms.unwrap_or(0.0),
            max_duration_ms: row.max_duration_ms.unwrap_or(0).max(0) as u64,
        }
    }
}

//! Retry and dead-letter decisions for failed dispatch attempts.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use marketflow_events::{AttemptResolution, EventRecord, RetryPolicy};

/// Applies a [`RetryPolicy`] to failed attempts and logs the outcome.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Budget to stamp on newly ingested events.
    pub fn default_max_retries(&self) -> u32 {
        self.policy.default_max_retries
    }

    /// Turn a failed attempt into either a scheduled retry or a dead letter.
    pub fn on_failure(
        &self,
        event: &EventRecord,
        error: String,
        now: DateTime<Utc>,
    ) -> AttemptResolution {
        let resolution =
            self.policy
                .resolve_failure(event.retry_count, event.max_retries, error, now);

        match &resolution {
            AttemptResolution::RetryScheduled {
                retry_count,
                next_retry_at,
                error,
            } => info!(
                event_id = %event.id,
                event_type = %event.event_type,
                retry_count,
                max_retries = event.max_retries,
                next_retry_at = %next_retry_at,
                error = %error,
                "retry scheduled"
            ),
            AttemptResolution::DeadLettered { retry_count, error } => warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                retry_count,
                max_retries = event.max_retries,
                error = %error,
                "retry budget exhausted, event dead-lettered"
            ),
            AttemptResolution::Completed { .. } => {}
        }

        resolution
    }
}

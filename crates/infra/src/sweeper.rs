//! Background retry sweep.
//!
//! Every `poll_interval` the sweeper claims a batch of due work and runs each
//! event on a bounded pool of tokio tasks. Due work is:
//!
//! - failed events whose backoff elapsed
//! - pending events nobody dispatched within `orphan_grace`
//! - processing events whose claim outlived `processing_lease`, i.e. the
//!   worker crashed or could not write the outcome

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use marketflow_events::EventStatus;

use crate::dispatcher::Dispatcher;
use crate::store::{EventStore, StoreError, SweepCutoffs};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to look for due work
    pub poll_interval: Duration,
    /// Maximum events claimed per sweep
    pub batch_size: u32,
    /// Maximum events dispatched concurrently
    pub max_concurrent: usize,
    /// Age after which a `pending` event counts as orphaned
    pub orphan_grace: Duration,
    /// Age after which a `processing` claim is presumed abandoned. Must
    /// exceed the longest a full handler chain can take.
    pub processing_lease: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            max_concurrent: 4,
            orphan_grace: Duration::from_secs(120),
            processing_lease: Duration::from_secs(600),
            name: "retry-sweeper".to_string(),
        }
    }
}

impl SweeperConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_processing_lease(mut self, lease: Duration) -> Self {
        self.processing_lease = lease;
        self
    }

    /// Selection cutoffs for a sweep running at `now`.
    pub fn cutoffs(&self, now: DateTime<Utc>) -> SweepCutoffs {
        SweepCutoffs {
            now,
            orphaned_before: before(now, self.orphan_grace),
            lease_expired_before: before(now, self.processing_lease),
        }
    }
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Result of a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub errors: usize,
}

/// Cumulative sweeper statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl SweeperStats {
    fn record(&mut self, report: &SweepReport) {
        self.sweeps += 1;
        self.claimed += report.claimed as u64;
        self.completed += report.completed as u64;
        self.failed += report.failed as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.errors += report.errors as u64;
    }
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Stop after the in-flight sweep finishes.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "retry sweeper task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> SweeperStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct RetrySweeper<S> {
    dispatcher: Arc<Dispatcher<S>>,
    config: SweeperConfig,
}

impl<S: EventStore + 'static> RetrySweeper<S> {
    pub fn new(dispatcher: Arc<Dispatcher<S>>, config: SweeperConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Claim one batch of due events and dispatch them.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let cutoffs = self.config.cutoffs(self.dispatcher.clock().now());

        let claimed = self
            .dispatcher
            .store()
            .claim_due(cutoffs, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(sweeper = %self.config.name, claimed = claimed.len(), "sweep claimed events");

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for record in claimed {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.spawn(async move {
                let _permit = permit;
                dispatcher.dispatch_claimed(record).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(dispatch)) => match dispatch.status {
                    EventStatus::Completed => report.completed += 1,
                    EventStatus::MaxRetriesExceeded => report.dead_lettered += 1,
                    _ => report.failed += 1,
                },
                Ok(Err(e)) => {
                    warn!(sweeper = %self.config.name, error = %e, "sweep dispatch failed");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(sweeper = %self.config.name, error = %e, "sweep task panicked");
                    report.errors += 1;
                }
            }
        }

        info!(
            sweeper = %self.config.name,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "sweep finished"
        );
        Ok(report)
    }

    /// Run the sweep loop on a tokio task until the handle shuts it down.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let task_stats = Arc::clone(&stats);

        let join = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(sweeper = %self.config.name, "retry sweeper started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = match self.run_once().await {
                            Ok(report) => report,
                            Err(e) => {
                                error!(sweeper = %self.config.name, error = %e, "sweep failed");
                                SweepReport { errors: 1, ..Default::default() }
                            }
                        };
                        let mut stats = match task_stats.lock() {
                            Ok(stats) => stats,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        stats.record(&report);
                        stats.uptime_secs = started.elapsed().as_secs();
                    }
                }
            }

            info!(sweeper = %self.config.name, "retry sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

//! Isolated execution of a single handler.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinError;
use tracing::{debug, warn};

use marketflow_events::{HandlerContext, HandlerError, HandlerRunStatus, NamedHandler};

/// What happened when one handler ran once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRun {
    pub handler_name: String,
    pub status: HandlerRunStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl HandlerRun {
    pub fn is_success(&self) -> bool {
        self.status == HandlerRunStatus::Success
    }
}

/// Runs handlers on their own task under a timeout.
///
/// A handler that returns an error, panics or overruns its timeout produces a
/// failed [`HandlerRun`]; none of those escape to the caller.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRuntime {
    timeout: Duration,
}

impl Default for HandlerRuntime {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl HandlerRuntime {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, handler: &NamedHandler, ctx: HandlerContext) -> HandlerRun {
        let started = Instant::now();
        let task_handler = Arc::clone(handler.handler());
        let mut task = tokio::spawn(async move { task_handler.handle(&ctx).await });

        let result = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HandlerError::Panicked(join_failure(join_err))),
            Err(_) => {
                task.abort();
                Err(HandlerError::TimedOut(millis(self.timeout)))
            }
        };
        let duration_ms = millis(started.elapsed());

        match result {
            Ok(()) => {
                debug!(handler = handler.name(), duration_ms, "handler succeeded");
                HandlerRun {
                    handler_name: handler.name().to_string(),
                    status: HandlerRunStatus::Success,
                    duration_ms,
                    error: None,
                }
            }
            Err(err) => {
                warn!(handler = handler.name(), duration_ms, error = %err, "handler failed");
                HandlerRun {
                    handler_name: handler.name().to_string(),
                    status: HandlerRunStatus::Failed,
                    duration_ms,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn join_failure(err: JoinError) -> String {
    if err.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => panic_message(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

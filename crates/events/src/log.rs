//! Append-only handler execution history.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketflow_core::{DomainError, EventId, LogId};

/// Outcome of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerRunStatus {
    Success,
    Failed,
}

impl HandlerRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerRunStatus::Success => "success",
            HandlerRunStatus::Failed => "failed",
        }
    }
}

impl FromStr for HandlerRunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(HandlerRunStatus::Success),
            "failed" => Ok(HandlerRunStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown handler run status: {other}"
            ))),
        }
    }
}

/// One row of forensic history: a single handler run for a single attempt.
///
/// Rows are never updated or deleted. Retries add new rows, so the log of an
/// event holds every attempt of every handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerExecutionLog {
    pub id: LogId,
    pub event_id: EventId,
    pub handler_name: String,
    /// Dispatch run this row belongs to (1-based, keeps counting across
    /// requeues).
    pub attempt: u32,
    /// Index of the handler in its route.
    pub position: u32,
    pub status: HandlerRunStatus,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HandlerExecutionLog {
    pub fn is_success(&self) -> bool {
        self.status == HandlerRunStatus::Success
    }
}

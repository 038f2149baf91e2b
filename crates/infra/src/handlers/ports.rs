//! Collaborator interfaces the standard handlers act through.
//!
//! The business logic behind these (escrow accounting, risk scoring, payout
//! rails, email delivery) lives outside the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use marketflow_core::EventId;
use marketflow_events::HandlerError;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Transient: the collaborator could not be reached or timed out.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<PortError> for HandlerError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Unavailable(msg) => HandlerError::Downstream(msg),
            PortError::Rejected(msg) => HandlerError::Rejected(msg),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Escrow
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldState {
    Held,
    Released,
    Refunded,
}

/// Funds held for one order until delivery is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowHold {
    pub order_id: String,
    pub store_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub state: HoldState,
}

#[async_trait::async_trait]
pub trait EscrowLedger: Send + Sync {
    async fn find_hold(&self, order_id: &str) -> Result<Option<EscrowHold>, PortError>;
    async fn create_hold(&self, hold: EscrowHold) -> Result<(), PortError>;
    async fn release_hold(&self, order_id: &str) -> Result<(), PortError>;
    async fn refund_hold(&self, order_id: &str) -> Result<(), PortError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    /// Seller-facing inbox of a store.
    StoreInbox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Providers drop a second message with the same key.
    pub dedupe_key: String,
    pub channel: Channel,
    pub recipient: String,
    pub template: String,
    pub data: JsonValue,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), PortError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique per event and handler; a second append with the same key is a no-op.
    pub entry_key: String,
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_id: String,
    pub store_id: Option<String>,
    pub payload: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait AuditTrail: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), PortError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Recalculation jobs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalculationKind {
    Ranking,
    SellerRisk,
    Inventory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculationJob {
    pub kind: RecalculationKind,
    pub store_id: String,
    pub order_id: String,
    pub requested_by: EventId,
}

#[async_trait::async_trait]
pub trait ScoringJobs: Send + Sync {
    /// Accept a job for asynchronous execution. Acceptance is success.
    async fn trigger(&self, job: RecalculationJob) -> Result<(), PortError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Payouts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutInstruction {
    pub payout_id: String,
    pub store_id: String,
    pub amount_minor: i64,
    pub currency: String,
}

#[async_trait::async_trait]
pub trait PayoutGateway: Send + Sync {
    async fn find_payout(&self, payout_id: &str) -> Result<Option<PayoutInstruction>, PortError>;
    async fn submit(&self, payout: PayoutInstruction) -> Result<(), PortError>;
}

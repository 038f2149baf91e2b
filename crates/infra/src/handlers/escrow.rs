//! Escrow handlers. Each one reads the current hold before acting, which is
//! what makes a re-run after a partial failure safe.

use std::sync::Arc;

use tracing::debug;

use marketflow_events::{EventHandler, HandlerContext, HandlerError};

use super::ports::{EscrowHold, EscrowLedger, HoldState};

/// `create_escrow`: hold the order total until delivery.
///
/// Payload: `total_amount` (minor units, > 0), `currency`.
pub struct CreateEscrow {
    ledger: Arc<dyn EscrowLedger>,
}

impl CreateEscrow {
    pub fn new(ledger: Arc<dyn EscrowLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait::async_trait]
impl EventHandler for CreateEscrow {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let order_id = ctx.aggregate_id.as_str();

        if self.ledger.find_hold(order_id).await?.is_some() {
            debug!(order_id, "escrow hold already exists");
            return Ok(());
        }

        let amount_minor = ctx.payload_i64("total_amount")?;
        if amount_minor <= 0 {
            return Err(HandlerError::InvalidPayload(format!(
                "total_amount must be positive, got {amount_minor}"
            )));
        }

        self.ledger
            .create_hold(EscrowHold {
                order_id: order_id.to_string(),
                store_id: ctx.require_store_id()?.to_string(),
                amount_minor,
                currency: ctx.payload_str("currency")?.to_string(),
                state: HoldState::Held,
            })
            .await?;
        Ok(())
    }
}

/// `release_escrow`: pay the seller once delivery is confirmed.
pub struct ReleaseEscrow {
    ledger: Arc<dyn EscrowLedger>,
}

impl ReleaseEscrow {
    pub fn new(ledger: Arc<dyn EscrowLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait::async_trait]
impl EventHandler for ReleaseEscrow {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let order_id = ctx.aggregate_id.as_str();

        match self.ledger.find_hold(order_id).await? {
            None => Err(HandlerError::Rejected(format!(
                "no escrow hold for order {order_id}"
            ))),
            Some(hold) => match hold.state {
                HoldState::Held => Ok(self.ledger.release_hold(order_id).await?),
                HoldState::Released => {
                    debug!(order_id, "escrow already released");
                    Ok(())
                }
                HoldState::Refunded => Err(HandlerError::Rejected(format!(
                    "escrow for order {order_id} was refunded"
                ))),
            },
        }
    }
}

/// `refund_escrow`: return held funds to the buyer on cancellation.
///
/// An order cancelled before escrow was created has nothing to refund.
pub struct RefundEscrow {
    ledger: Arc<dyn EscrowLedger>,
}

impl RefundEscrow {
    pub fn new(ledger: Arc<dyn EscrowLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait::async_trait]
impl EventHandler for RefundEscrow {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let order_id = ctx.aggregate_id.as_str();

        match self.ledger.find_hold(order_id).await? {
            None => {
                debug!(order_id, "no escrow hold to refund");
                Ok(())
            }
            Some(hold) => match hold.state {
                HoldState::Held => Ok(self.ledger.refund_hold(order_id).await?),
                HoldState::Refunded => Ok(()),
                HoldState::Released => Err(HandlerError::Rejected(format!(
                    "escrow for order {order_id} was already released to the seller"
                ))),
            },
        }
    }
}

use std::sync::Arc;

use tracing::debug;

use marketflow_events::{EventHandler, HandlerContext, HandlerError};

use super::ports::{PayoutGateway, PayoutInstruction};

/// `process_payout`: submit a seller payout to the gateway.
///
/// The aggregate id is the payout id. Payload: `amount` (minor units, > 0),
/// `currency`. A payout the gateway already knows is not submitted again.
pub struct ProcessPayout {
    gateway: Arc<dyn PayoutGateway>,
}

impl ProcessPayout {
    pub fn new(gateway: Arc<dyn PayoutGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait::async_trait]
impl EventHandler for ProcessPayout {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let payout_id = ctx.aggregate_id.as_str();

        if self.gateway.find_payout(payout_id).await?.is_some() {
            debug!(payout_id, "payout already submitted");
            return Ok(());
        }

        let amount_minor = ctx.payload_i64("amount")?;
        if amount_minor <= 0 {
            return Err(HandlerError::InvalidPayload(format!(
                "amount must be positive, got {amount_minor}"
            )));
        }

        self.gateway
            .submit(PayoutInstruction {
                payout_id: payout_id.to_string(),
                store_id: ctx.require_store_id()?.to_string(),
                amount_minor,
                currency: ctx.payload_str("currency")?.to_string(),
            })
            .await?;
        Ok(())
    }
}

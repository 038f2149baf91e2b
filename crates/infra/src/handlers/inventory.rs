use marketflow_events::{EventHandler, HandlerContext, HandlerError};

/// `decrement_stock`: intentionally does nothing.
///
/// Checkout reserves and decrements stock synchronously before
/// `order.created` is emitted. The route keeps the name so the history
/// shows the step and a real implementation can be dropped in later.
#[derive(Debug, Default)]
pub struct DecrementStock;

#[async_trait::async_trait]
impl EventHandler for DecrementStock {
    async fn handle(&self, _ctx: &HandlerContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

use std::sync::Arc;

use marketflow_core::Clock;
use marketflow_events::{EventHandler, HandlerContext, HandlerError, names};

use super::ports::{AuditEntry, AuditTrail};

/// `audit_log`: append the event to the platform audit trail.
///
/// The entry key is derived from the event id, so a retry re-appends the same
/// key and the trail keeps a single row.
pub struct AuditLog {
    trail: Arc<dyn AuditTrail>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(trail: Arc<dyn AuditTrail>, clock: Arc<dyn Clock>) -> Self {
        Self { trail, clock }
    }
}

#[async_trait::async_trait]
impl EventHandler for AuditLog {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        self.trail
            .append(AuditEntry {
                entry_key: format!("{}:{}", ctx.event_id, names::AUDIT_LOG),
                event_id: ctx.event_id,
                event_type: ctx.event_type.clone(),
                aggregate_id: ctx.aggregate_id.clone(),
                store_id: ctx.store_id.clone(),
                payload: ctx.payload.clone(),
                recorded_at: self.clock.now(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketflow_core::{EventId, SystemClock};

    use crate::handlers::memory::InMemoryAuditTrail;

    #[tokio::test]
    async fn retries_do_not_duplicate_entries() {
        let trail = Arc::new(InMemoryAuditTrail::default());
        let handler = AuditLog::new(trail.clone(), Arc::new(SystemClock));
        let ctx = HandlerContext {
            event_id: EventId::new(),
            event_type: "payment.paid".to_string(),
            aggregate_id: "pay_1".to_string(),
            store_id: Some("store_1".to_string()),
            payload: serde_json::json!({"amount": 100}),
        };

        handler.handle(&ctx).await.unwrap();
        handler.handle(&ctx).await.unwrap();

        let entries = trail.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "payment.paid");
    }
}

use std::sync::Arc;

use marketflow_events::{EventHandler, HandlerContext, HandlerError};

use super::ports::{Channel, Notification, Notifier};

/// Which message a [`SendNotification`] handler sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// `send_confirmation`
    OrderConfirmation,
    /// `send_payment_receipt`
    PaymentReceipt,
    /// `send_cancellation`
    Cancellation,
    /// `notify_store`
    StoreAlert,
}

impl NotificationKind {
    fn template(&self, event_type: &str) -> String {
        match self {
            NotificationKind::OrderConfirmation => "order_confirmation".to_string(),
            NotificationKind::PaymentReceipt => "payment_receipt".to_string(),
            NotificationKind::Cancellation => "order_cancellation".to_string(),
            NotificationKind::StoreAlert => format!("store_alert.{event_type}"),
        }
    }
}

/// Sends one templated message for an event.
///
/// Buyer-facing kinds go to `customer_email`, falling back to `customer_phone`
/// (SMS). Store alerts go to the store's inbox. The dedupe key is derived from
/// the event id, so a retried event never notifies twice.
pub struct SendNotification {
    notifier: Arc<dyn Notifier>,
    kind: NotificationKind,
}

impl SendNotification {
    pub fn new(notifier: Arc<dyn Notifier>, kind: NotificationKind) -> Self {
        Self { notifier, kind }
    }

    fn recipient(&self, ctx: &HandlerContext) -> Result<(Channel, String), HandlerError> {
        if self.kind == NotificationKind::StoreAlert {
            return Ok((Channel::StoreInbox, ctx.require_store_id()?.to_string()));
        }

        if let Some(email) = ctx.optional_payload_str("customer_email") {
            Ok((Channel::Email, email.to_string()))
        } else if let Some(phone) = ctx.optional_payload_str("customer_phone") {
            Ok((Channel::Sms, phone.to_string()))
        } else {
            Err(HandlerError::InvalidPayload(
                "customer_email or customer_phone is required".to_string(),
            ))
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for SendNotification {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let (channel, recipient) = self.recipient(ctx)?;
        let template = self.kind.template(&ctx.event_type);

        self.notifier
            .send(Notification {
                dedupe_key: format!("{}:{}", ctx.event_id, template),
                channel,
                recipient,
                template,
                data: ctx.payload.clone(),
            })
            .await?;
        Ok(())
    }
}

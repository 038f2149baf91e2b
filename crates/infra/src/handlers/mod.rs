//! The commerce platform's handlers and the collaborators they call.

pub mod audit;
pub mod escrow;
pub mod inventory;
pub mod memory;
pub mod notifications;
pub mod payout;
pub mod ports;
pub mod recalculation;

use std::sync::Arc;

use marketflow_core::Clock;
use marketflow_events::{HandlerCatalog, HandlerRegistry, RegistryError, RoutingTable, names};

pub use memory::InMemoryPorts;
pub use ports::{AuditTrail, EscrowLedger, Notifier, PayoutGateway, PortError, ScoringJobs};

use audit::AuditLog;
use escrow::{CreateEscrow, RefundEscrow, ReleaseEscrow};
use inventory::DecrementStock;
use notifications::{NotificationKind, SendNotification};
use payout::ProcessPayout;
use ports::RecalculationKind;
use recalculation::Recalculate;

/// Collaborators the standard handlers are built over.
#[derive(Clone)]
pub struct HandlerPorts {
    pub escrow: Arc<dyn EscrowLedger>,
    pub notifier: Arc<dyn Notifier>,
    pub audit: Arc<dyn AuditTrail>,
    pub scoring: Arc<dyn ScoringJobs>,
    pub payouts: Arc<dyn PayoutGateway>,
}

/// Every standard handler, under its route name.
pub fn standard_catalog(ports: &HandlerPorts, clock: Arc<dyn Clock>) -> HandlerCatalog {
    let notify = |kind| Arc::new(SendNotification::new(ports.notifier.clone(), kind));
    let recalc = |kind| Arc::new(Recalculate::new(ports.scoring.clone(), kind));

    HandlerCatalog::new()
        .register(names::CREATE_ESCROW, Arc::new(CreateEscrow::new(ports.escrow.clone())))
        .register(names::RELEASE_ESCROW, Arc::new(ReleaseEscrow::new(ports.escrow.clone())))
        .register(names::REFUND_ESCROW, Arc::new(RefundEscrow::new(ports.escrow.clone())))
        .register(names::DECREMENT_STOCK, Arc::new(DecrementStock))
        .register(names::SEND_CONFIRMATION, notify(NotificationKind::OrderConfirmation))
        .register(names::SEND_PAYMENT_RECEIPT, notify(NotificationKind::PaymentReceipt))
        .register(names::SEND_CANCELLATION, notify(NotificationKind::Cancellation))
        .register(names::NOTIFY_STORE, notify(NotificationKind::StoreAlert))
        .register(names::AUDIT_LOG, Arc::new(AuditLog::new(ports.audit.clone(), clock)))
        .register(names::RECALCULATE_RANKING, recalc(RecalculationKind::Ranking))
        .register(names::RECALCULATE_SELLER_RISK, recalc(RecalculationKind::SellerRisk))
        .register(names::RECALCULATE_INVENTORY, recalc(RecalculationKind::Inventory))
        .register(names::PROCESS_PAYOUT, Arc::new(ProcessPayout::new(ports.payouts.clone())))
}

/// The standard routing table resolved against [`standard_catalog`].
pub fn standard_registry(
    ports: &HandlerPorts,
    clock: Arc<dyn Clock>,
) -> Result<HandlerRegistry, RegistryError> {
    HandlerRegistry::build(&RoutingTable::standard(), &standard_catalog(ports, clock))
}

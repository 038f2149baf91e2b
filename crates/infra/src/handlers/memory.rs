//! In-memory collaborators for development and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::ports::{
    AuditEntry, AuditTrail, EscrowHold, EscrowLedger, HoldState, Notification, Notifier,
    PayoutGateway, PayoutInstruction, PortError, RecalculationJob, ScoringJobs,
};
use super::HandlerPorts;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PortError> {
    mutex
        .lock()
        .map_err(|_| PortError::Unavailable("collaborator state lock poisoned".to_string()))
}

fn snapshot<T: Clone>(mutex: &Mutex<T>) -> T {
    match mutex.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Switch to make an adapter report itself unreachable.
#[derive(Debug, Default)]
struct Outage(AtomicBool);

impl Outage {
    fn set(&self, down: bool) {
        self.0.store(down, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<(), PortError> {
        if self.0.load(Ordering::SeqCst) {
            Err(PortError::Unavailable(format!("{what} is unreachable")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEscrowLedger {
    holds: Mutex<HashMap<String, EscrowHold>>,
    outage: Outage,
}

impl InMemoryEscrowLedger {
    pub fn hold(&self, order_id: &str) -> Option<EscrowHold> {
        snapshot(&self.holds).remove(order_id)
    }

    pub fn set_unavailable(&self, down: bool) {
        self.outage.set(down);
    }

    fn transition(&self, order_id: &str, to: HoldState) -> Result<(), PortError> {
        self.outage.check("escrow ledger")?;
        let mut holds = lock(&self.holds)?;
        let hold = holds
            .get_mut(order_id)
            .ok_or_else(|| PortError::Rejected(format!("no escrow hold for order {order_id}")))?;
        if hold.state != HoldState::Held {
            return Err(PortError::Rejected(format!(
                "escrow hold for order {order_id} is {:?}",
                hold.state
            )));
        }
        hold.state = to;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EscrowLedger for InMemoryEscrowLedger {
    async fn find_hold(&self, order_id: &str) -> Result<Option<EscrowHold>, PortError> {
        self.outage.check("escrow ledger")?;
        Ok(lock(&self.holds)?.get(order_id).cloned())
    }

    async fn create_hold(&self, hold: EscrowHold) -> Result<(), PortError> {
        self.outage.check("escrow ledger")?;
        let mut holds = lock(&self.holds)?;
        if holds.contains_key(&hold.order_id) {
            return Err(PortError::Rejected(format!(
                "escrow hold for order {} already exists",
                hold.order_id
            )));
        }
        holds.insert(hold.order_id.clone(), hold);
        Ok(())
    }

    async fn release_hold(&self, order_id: &str) -> Result<(), PortError> {
        self.transition(order_id, HoldState::Released)
    }

    async fn refund_hold(&self, order_id: &str) -> Result<(), PortError> {
        self.transition(order_id, HoldState::Refunded)
    }
}

/// Records every accepted notification; drops repeats by `dedupe_key`.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    outage: Outage,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        snapshot(&self.sent)
    }

    pub fn set_unavailable(&self, down: bool) {
        self.outage.set(down);
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> Result<(), PortError> {
        self.outage.check("notification provider")?;
        let mut sent = lock(&self.sent)?;
        if !sent.iter().any(|n| n.dedupe_key == notification.dedupe_key) {
            sent.push(notification);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditTrail {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditTrail {
    pub fn entries(&self) -> Vec<AuditEntry> {
        snapshot(&self.entries)
    }
}

#[async_trait::async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn append(&self, entry: AuditEntry) -> Result<(), PortError> {
        let mut entries = lock(&self.entries)?;
        if !entries.iter().any(|e| e.entry_key == entry.entry_key) {
            entries.push(entry);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct QueuedScoringJobs {
    jobs: Mutex<Vec<RecalculationJob>>,
}

impl QueuedScoringJobs {
    pub fn jobs(&self) -> Vec<RecalculationJob> {
        snapshot(&self.jobs)
    }
}

#[async_trait::async_trait]
impl ScoringJobs for QueuedScoringJobs {
    async fn trigger(&self, job: RecalculationJob) -> Result<(), PortError> {
        lock(&self.jobs)?.push(job);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPayoutGateway {
    payouts: Mutex<HashMap<String, PayoutInstruction>>,
    outage: Outage,
}

impl InMemoryPayoutGateway {
    pub fn payouts(&self) -> Vec<PayoutInstruction> {
        snapshot(&self.payouts).into_values().collect()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.outage.set(down);
    }
}

#[async_trait::async_trait]
impl PayoutGateway for InMemoryPayoutGateway {
    async fn find_payout(&self, payout_id: &str) -> Result<Option<PayoutInstruction>, PortError> {
        self.outage.check("payout gateway")?;
        Ok(lock(&self.payouts)?.get(payout_id).cloned())
    }

    async fn submit(&self, payout: PayoutInstruction) -> Result<(), PortError> {
        self.outage.check("payout gateway")?;
        lock(&self.payouts)?.insert(payout.payout_id.clone(), payout);
        Ok(())
    }
}

/// Concrete in-memory adapters, kept so callers can inspect them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPorts {
    pub escrow: Arc<InMemoryEscrowLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<InMemoryAuditTrail>,
    pub scoring: Arc<QueuedScoringJobs>,
    pub payouts: Arc<InMemoryPayoutGateway>,
}

impl InMemoryPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ports(&self) -> HandlerPorts {
        HandlerPorts {
            escrow: self.escrow.clone(),
            notifier: self.notifier.clone(),
            audit: self.audit.clone(),
            scoring: self.scoring.clone(),
            payouts: self.payouts.clone(),
        }
    }
}

use std::sync::Arc;

use marketflow_events::{EventHandler, HandlerContext, HandlerError};

use super::ports::{RecalculationJob, RecalculationKind, ScoringJobs};

/// `recalculate_ranking`, `recalculate_seller_risk`, `recalculate_inventory`:
/// hand a job to the scoring service. Success means the job was accepted;
/// the computation itself runs elsewhere.
pub struct Recalculate {
    jobs: Arc<dyn ScoringJobs>,
    kind: RecalculationKind,
}

impl Recalculate {
    pub fn new(jobs: Arc<dyn ScoringJobs>, kind: RecalculationKind) -> Self {
        Self { jobs, kind }
    }
}

#[async_trait::async_trait]
impl EventHandler for Recalculate {
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        self.jobs
            .trigger(RecalculationJob {
                kind: self.kind,
                store_id: ctx.require_store_id()?.to_string(),
                order_id: ctx.aggregate_id.clone(),
                requested_by: ctx.event_id,
            })
            .await?;
        Ok(())
    }
}

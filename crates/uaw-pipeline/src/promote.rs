//! Dimensional promotion: staging -> marts as one transaction.
//!
//! Statement order inside the transaction is fixed: claim unprocessed rows,
//! upsert `dim_users`, upsert `dim_actions`, insert facts, probe data quality,
//! flip `is_processed`. Any failure rolls back all of it, so a staging row is
//! processed if and only if its fact row exists.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uaw_core::{DqReport, PromotionStep};
use uaw_storage::{PromotionTx, Warehouse};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub claimed: usize,
    pub new_users: u64,
    pub new_actions: u64,
    pub facts_inserted: usize,
    pub marked_processed: u64,
    /// Claimed rows that got no fact (no dimension match or null timestamp);
    /// they stay unprocessed and are retried next run.
    pub left_pending: usize,
    pub dq: DqReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PromotionOutcome {
    NothingPending,
    Promoted(PromotionReport),
}

struct StepCounts {
    claimed: usize,
    new_users: u64,
    new_actions: u64,
    facts_inserted: usize,
    marked_processed: u64,
    dq: DqReport,
}

pub struct Promoter<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> Promoter<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    pub async fn promote(&self) -> Result<PromotionOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("promotion", %run_id, backend = self.warehouse.backend());
        self.promote_inner(run_id).instrument(span).await
    }

    async fn promote_inner(&self, run_id: Uuid) -> Result<PromotionOutcome> {
        info!("starting transform and load (staging -> marts)");
        let started_at = Utc::now();

        let mut tx = self.warehouse.begin_promotion().await?;
        let counts = match run_steps(tx.as_mut(), run_id).await {
            Ok(counts) => counts,
            Err(err) => {
                error!(error = %err, "promotion failed; rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "explicit rollback failed; connection drop will abort");
                }
                return Err(err.into());
            }
        };

        if counts.claimed == 0 {
            tx.commit().await?;
            info!("no unprocessed staging rows; nothing to promote");
            return Ok(PromotionOutcome::NothingPending);
        }

        tx.commit().await.map_err(|err| {
            error!(error = %err, step = %PromotionStep::Commit, "promotion commit failed");
            err
        })?;

        let report = PromotionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            claimed: counts.claimed,
            new_users: counts.new_users,
            new_actions: counts.new_actions,
            facts_inserted: counts.facts_inserted,
            marked_processed: counts.marked_processed,
            left_pending: counts.claimed - counts.facts_inserted,
            dq: counts.dq,
        };
        if report.left_pending > 0 {
            warn!(left_pending = report.left_pending, "some claimed rows were not promoted");
        }
        info!(
            claimed = report.claimed,
            facts = report.facts_inserted,
            new_users = report.new_users,
            new_actions = report.new_actions,
            "transform and load completed"
        );
        Ok(PromotionOutcome::Promoted(report))
    }
}

async fn run_steps(
    tx: &mut dyn PromotionTx,
    run_id: Uuid,
) -> std::result::Result<StepCounts, uaw_storage::StorageError> {
    let claimed = tx.claim_unprocessed().await?;
    if claimed.is_empty() {
        return Ok(StepCounts {
            claimed: 0,
            new_users: 0,
            new_actions: 0,
            facts_inserted: 0,
            marked_processed: 0,
            dq: DqReport::default(),
        });
    }
    debug!(claimed = claimed.len(), "claimed unprocessed staging rows");

    debug!("updating dim_users");
    let new_users = tx.upsert_dim_users(&claimed).await?;

    debug!("updating dim_actions");
    let new_actions = tx.upsert_dim_actions(&claimed).await?;

    debug!("loading fact_user_actions");
    let promoted = tx.insert_facts(&claimed).await?;

    let dq = DqReport {
        null_fact_keys: tx.count_null_fact_keys().await?,
    };
    emit_dq_event(run_id, &dq);

    debug!("marking staging records as processed");
    let marked_processed = tx.mark_processed(&promoted).await?;

    Ok(StepCounts {
        claimed: claimed.len(),
        new_users,
        new_actions,
        facts_inserted: promoted.len(),
        marked_processed,
        dq,
    })
}

/// Structured advisory signal; never blocks the commit.
fn emit_dq_event(run_id: Uuid, dq: &DqReport) {
    if dq.passed() {
        debug!(
            target: "uaw::dq",
            %run_id,
            null_fact_keys = dq.null_fact_keys,
            passed = true,
            "DQ passed: no null event_timestamp/user_key/action_key in fact_user_actions"
        );
    } else {
        warn!(
            target: "uaw::dq",
            %run_id,
            null_fact_keys = dq.null_fact_keys,
            passed = false,
            "DQ warning: fact rows with null event_timestamp/user_key/action_key"
        );
    }
}

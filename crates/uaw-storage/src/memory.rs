//! In-memory warehouse with the same promotion semantics as Postgres.
//!
//! A promotion holds the state lock for its whole lifetime and works on a
//! copy, so concurrent promotions serialise and an uncommitted transaction
//! leaves no trace.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uaw_core::{
    DimAction, DimUser, FactUserAction, PromotionStep, StagedRow, StagingRecord, WarehouseCounts,
};

use crate::{PromotionTx, StorageError, Warehouse};

#[derive(Debug, Clone, Default)]
struct WarehouseState {
    staging: Vec<StagedRow>,
    dim_users: Vec<DimUser>,
    dim_actions: Vec<DimAction>,
    facts: Vec<FactUserAction>,
    next_stg_id: i64,
    next_user_key: i64,
    next_action_key: i64,
}

impl WarehouseState {
    fn claimed_rows<'a>(&'a self, claimed: &'a [i64]) -> impl Iterator<Item = &'a StagedRow> + 'a {
        self.staging
            .iter()
            .filter(move |row| claimed.contains(&row.stg_id))
    }
}

#[derive(Debug, Clone, Default)]
struct Faults {
    append: bool,
    promotion_step: Option<PromotionStep>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `append_staging` fail until cleared.
    pub async fn fail_appends(&self, fail: bool) {
        self.faults.lock().await.append = fail;
    }

    /// Make promotions fail when they reach `step`; `None` clears the fault.
    pub async fn fail_promotion_at(&self, step: Option<PromotionStep>) {
        self.faults.lock().await.promotion_step = step;
    }

    /// Insert a fact row directly, bypassing the dimension checks a
    /// promotion applies. Keys that match no dimension row show up in the
    /// data-quality count of every later promotion.
    pub async fn seed_fact(&self, fact: FactUserAction) {
        self.state.lock().await.facts.push(fact);
    }

    pub async fn staged_rows(&self) -> Vec<StagedRow> {
        self.state.lock().await.staging.clone()
    }

    pub async fn dim_users(&self) -> Vec<DimUser> {
        self.state.lock().await.dim_users.clone()
    }

    pub async fn dim_actions(&self) -> Vec<DimAction> {
        self.state.lock().await.dim_actions.clone()
    }

    pub async fn facts(&self) -> Vec<FactUserAction> {
        self.state.lock().await.facts.clone()
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn append_staging(&self, rows: &[StagingRecord]) -> Result<u64, StorageError> {
        if self.faults.lock().await.append {
            return Err(StorageError::Append("injected append failure".to_string()));
        }

        let mut state = self.state.lock().await;
        for record in rows {
            state.next_stg_id += 1;
            let stg_id = state.next_stg_id;
            state.staging.push(StagedRow {
                stg_id,
                record: StagingRecord {
                    is_processed: false,
                    ..record.clone()
                },
            });
        }
        debug!(rows = rows.len(), "appended rows to in-memory staging");
        Ok(rows.len() as u64)
    }

    async fn begin_promotion(&self) -> Result<Box<dyn PromotionTx>, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        let fail_at = self.faults.lock().await.promotion_step;
        Ok(Box::new(MemoryPromotionTx {
            guard,
            working,
            fail_at,
        }))
    }

    async fn counts(&self) -> Result<WarehouseCounts, StorageError> {
        let state = self.state.lock().await;
        Ok(WarehouseCounts {
            staging_rows: state.staging.len() as i64,
            unprocessed_rows: state
                .staging
                .iter()
                .filter(|row| !row.record.is_processed)
                .count() as i64,
            dim_users: state.dim_users.len() as i64,
            dim_actions: state.dim_actions.len() as i64,
            facts: state.facts.len() as i64,
        })
    }

    async fn close(&self) {}
}

struct MemoryPromotionTx {
    guard: OwnedMutexGuard<WarehouseState>,
    working: WarehouseState,
    fail_at: Option<PromotionStep>,
}

impl MemoryPromotionTx {
    fn check(&self, step: PromotionStep) -> Result<(), StorageError> {
        if self.fail_at == Some(step) {
            return Err(StorageError::Step {
                step,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PromotionTx for MemoryPromotionTx {
    async fn claim_unprocessed(&mut self) -> Result<Vec<i64>, StorageError> {
        self.check(PromotionStep::Claim)?;
        Ok(self
            .working
            .staging
            .iter()
            .filter(|row| !row.record.is_processed)
            .map(|row| row.stg_id)
            .collect())
    }

    async fn upsert_dim_users(&mut self, claimed: &[i64]) -> Result<u64, StorageError> {
        self.check(PromotionStep::UpsertUsers)?;
        let candidates: BTreeSet<String> = self
            .working
            .claimed_rows(claimed)
            .map(|row| row.record.user_id.clone())
            .collect();

        let mut inserted = 0u64;
        for user_id in candidates {
            if self.working.dim_users.iter().any(|d| d.user_id == user_id) {
                continue;
            }
            self.working.next_user_key += 1;
            let user_key = self.working.next_user_key;
            self.working.dim_users.push(DimUser { user_key, user_id });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn upsert_dim_actions(&mut self, claimed: &[i64]) -> Result<u64, StorageError> {
        self.check(PromotionStep::UpsertActions)?;
        let candidates: BTreeSet<String> = self
            .working
            .claimed_rows(claimed)
            .map(|row| row.record.action_type.clone())
            .collect();

        let mut inserted = 0u64;
        for action_type in candidates {
            if self
                .working
                .dim_actions
                .iter()
                .any(|d| d.action_type == action_type)
            {
                continue;
            }
            self.working.next_action_key += 1;
            let action_key = self.working.next_action_key;
            self.working.dim_actions.push(DimAction {
                action_key,
                action_type,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn insert_facts(&mut self, claimed: &[i64]) -> Result<Vec<i64>, StorageError> {
        self.check(PromotionStep::InsertFacts)?;
        let users: HashMap<&str, i64> = self
            .working
            .dim_users
            .iter()
            .map(|d| (d.user_id.as_str(), d.user_key))
            .collect();
        let actions: HashMap<&str, i64> = self
            .working
            .dim_actions
            .iter()
            .map(|d| (d.action_type.as_str(), d.action_key))
            .collect();

        let mut new_facts = Vec::new();
        for row in self.working.claimed_rows(claimed) {
            let (Some(&user_key), Some(&action_key), Some(event_timestamp)) = (
                users.get(row.record.user_id.as_str()),
                actions.get(row.record.action_type.as_str()),
                row.record.timestamp,
            ) else {
                continue;
            };
            if self.working.facts.iter().any(|f| f.stg_id == row.stg_id) {
                return Err(StorageError::Step {
                    step: PromotionStep::InsertFacts,
                    message: format!("duplicate fact for stg_id {}", row.stg_id),
                });
            }
            new_facts.push(FactUserAction {
                stg_id: row.stg_id,
                user_key,
                action_key,
                event_timestamp,
                device: row.record.device.clone(),
                location: row.record.location.clone(),
            });
        }

        let promoted = new_facts.iter().map(|f| f.stg_id).collect();
        self.working.facts.extend(new_facts);
        Ok(promoted)
    }

    async fn count_null_fact_keys(&mut self) -> Result<i64, StorageError> {
        self.check(PromotionStep::QualityCheck)?;
        // keys are non-nullable here; a dangling key is the equivalent violation
        let dangling = self
            .working
            .facts
            .iter()
            .filter(|f| {
                !self.working.dim_users.iter().any(|d| d.user_key == f.user_key)
                    || !self
                        .working
                        .dim_actions
                        .iter()
                        .any(|d| d.action_key == f.action_key)
            })
            .count();
        Ok(dangling as i64)
    }

    async fn mark_processed(&mut self, promoted: &[i64]) -> Result<u64, StorageError> {
        self.check(PromotionStep::MarkProcessed)?;
        let mut updated = 0u64;
        for row in self
            .working
            .staging
            .iter_mut()
            .filter(|row| promoted.contains(&row.stg_id) && !row.record.is_processed)
        {
            row.record.is_processed = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.check(PromotionStep::Commit)?;
        let MemoryPromotionTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

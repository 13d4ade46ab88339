use crate::domain::charge::{Amount, ChargeRecord, IdempotencyKey, RecordOutcome};
use crate::domain::orchestration::{HistoryEvent, RunId};
use crate::domain::ports::{ChargeStore, HistoryStore};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory idempotent charge store.
///
/// The check-and-insert happens under a single write lock, so racing callers on the
/// same key are serialized and exactly one of them creates the record.
#[derive(Default, Clone)]
pub struct InMemoryChargeStore {
    charges: Arc<RwLock<HashMap<IdempotencyKey, ChargeRecord>>>,
}

impl InMemoryChargeStore {
    /// Creates a new, empty in-memory charge store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChargeStore for InMemoryChargeStore {
    async fn record_charge(
        &self,
        key: &IdempotencyKey,
        customer_id: &str,
        amount: Amount,
    ) -> Result<RecordOutcome> {
        let mut charges = self.charges.write().await;
        match charges.entry(key.clone()) {
            Entry::Occupied(_) => Ok(RecordOutcome::AlreadyRecorded),
            Entry::Vacant(slot) => {
                slot.insert(ChargeRecord {
                    idempotency_key: key.clone(),
                    customer_id: customer_id.to_string(),
                    amount: amount.value(),
                    created_at: Utc::now(),
                });
                Ok(RecordOutcome::Created)
            }
        }
    }

    async fn get_charge(&self, key: &IdempotencyKey) -> Result<Option<ChargeRecord>> {
        let charges = self.charges.read().await;
        Ok(charges.get(key).cloned())
    }

    async fn list_charges(&self) -> Result<Vec<ChargeRecord>> {
        let charges = self.charges.read().await;
        let mut all: Vec<ChargeRecord> = charges.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

/// A thread-safe in-memory orchestration history.
///
/// Survives a host being dropped as long as a clone of the store is kept, which is
/// how tests simulate a process restart.
#[derive(Default, Clone)]
pub struct InMemoryHistoryStore {
    runs: Arc<RwLock<BTreeMap<RunId, Vec<HistoryEvent>>>>,
}

impl InMemoryHistoryStore {
    /// Creates a new, empty in-memory history store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, run: &RunId, event: HistoryEvent) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.entry(run.clone()).or_default().push(event);
        Ok(())
    }

    async fn load(&self, run: &RunId) -> Result<Vec<HistoryEvent>> {
        let runs = self.runs.read().await;
        Ok(runs.get(run).cloned().unwrap_or_default())
    }

    async fn latest_run(&self, orchestration_id: &str) -> Result<Option<u32>> {
        let runs = self.runs.read().await;
        Ok(runs
            .keys()
            .filter(|id| id.orchestration_id == orchestration_id)
            .map(|id| id.run)
            .max())
    }

    async fn runs(&self) -> Result<Vec<RunId>> {
        let runs = self.runs.read().await;
        Ok(runs.keys().cloned().collect())
    }
}

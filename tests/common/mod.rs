#![allow(dead_code)]

use async_trait::async_trait;
use durable_charge::application::clock::HostClock;
use durable_charge::application::host::{ExecutionHost, HostConfig, StartRequest};
use durable_charge::application::operation::ChargeOperation;
use durable_charge::domain::charge::{Amount, ChargeRecord, IdempotencyKey, RecordOutcome};
use durable_charge::domain::orchestration::{HistoryEvent, RunId};
use durable_charge::domain::ports::{ChargeStore, ChargeStoreHandle, HistoryStore, HistoryStoreHandle};
use durable_charge::domain::retry::RetryPolicy;
use durable_charge::error::{ChargeError, Result};
use durable_charge::infrastructure::gateway::SimulatedGateway;
use durable_charge::infrastructure::in_memory::{InMemoryChargeStore, InMemoryHistoryStore};
use rust_decimal::Decimal;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stores and clock that outlive any single host, so dropping a host and building
/// another one over the same `World` behaves like a process restart.
pub struct World {
    pub charges: InMemoryChargeStore,
    pub history: InMemoryHistoryStore,
    pub clock: HostClock,
}

impl World {
    pub fn new() -> Self {
        Self {
            charges: InMemoryChargeStore::new(),
            history: InMemoryHistoryStore::new(),
            clock: HostClock::new(),
        }
    }

    pub fn host(&self, gateway: SimulatedGateway, retry_policy: RetryPolicy) -> ExecutionHost {
        self.host_with_store(Arc::new(self.charges.clone()), gateway, retry_policy)
    }

    pub fn host_with_store(
        &self,
        store: ChargeStoreHandle,
        gateway: SimulatedGateway,
        retry_policy: RetryPolicy,
    ) -> ExecutionHost {
        self.host_with_stores(store, Arc::new(self.history.clone()), gateway, retry_policy)
    }

    pub fn host_with_stores(
        &self,
        store: ChargeStoreHandle,
        history: HistoryStoreHandle,
        gateway: SimulatedGateway,
        retry_policy: RetryPolicy,
    ) -> ExecutionHost {
        ExecutionHost::new(
            history,
            ChargeOperation::new(store, Arc::new(gateway)),
            self.clock,
            HostConfig {
                retry_policy,
                max_concurrent_operations: 8,
            },
        )
    }

    pub async fn records(&self) -> Vec<ChargeRecord> {
        self.charges.list_charges().await.unwrap()
    }
}

pub fn request(
    customer_id: &str,
    amount: Decimal,
    wait_seconds: u64,
    orchestration_id: Option<&str>,
) -> StartRequest {
    StartRequest {
        customer_id: customer_id.to_string(),
        amount,
        wait_seconds,
        orchestration_id: orchestration_id.map(str::to_string),
    }
}

pub async fn history_of(host: &ExecutionHost, orchestration_id: &str) -> Vec<HistoryEvent> {
    let run: RunId = host.latest_run(orchestration_id).await.unwrap();
    host.history(&run).await.unwrap()
}

/// Charge store whose first `failures` writes report the store as unavailable.
#[derive(Clone)]
pub struct FlakyChargeStore {
    inner: InMemoryChargeStore,
    failures: u32,
    writes: Arc<AtomicU32>,
}

impl FlakyChargeStore {
    pub fn new(inner: InMemoryChargeStore, failures: u32) -> Self {
        Self {
            inner,
            failures,
            writes: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl ChargeStore for FlakyChargeStore {
    async fn record_charge(
        &self,
        key: &IdempotencyKey,
        customer_id: &str,
        amount: Amount,
    ) -> Result<RecordOutcome> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if write <= self.failures {
            return Err(ChargeError::StoreUnavailable("connection refused".to_string()));
        }
        self.inner.record_charge(key, customer_id, amount).await
    }

    async fn get_charge(&self, key: &IdempotencyKey) -> Result<Option<ChargeRecord>> {
        self.inner.get_charge(key).await
    }

    async fn list_charges(&self) -> Result<Vec<ChargeRecord>> {
        self.inner.list_charges().await
    }
}

/// History store whose first `failures` appends of successful attempts fail.
#[derive(Clone)]
pub struct FlakyHistoryStore {
    inner: InMemoryHistoryStore,
    failures: u32,
    rejected: Arc<AtomicU32>,
}

impl FlakyHistoryStore {
    pub fn new(inner: InMemoryHistoryStore, failures: u32) -> Self {
        Self {
            inner,
            failures,
            rejected: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Number of appends rejected so far.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for FlakyHistoryStore {
    async fn append(&self, run: &RunId, event: HistoryEvent) -> Result<()> {
        if matches!(event, HistoryEvent::AttemptSucceeded { .. }) {
            let rejected = self.rejected.load(Ordering::SeqCst);
            if rejected < self.failures {
                self.rejected.store(rejected + 1, Ordering::SeqCst);
                return Err(ChargeError::StoreUnavailable("disk full".to_string()));
            }
        }
        self.inner.append(run, event).await
    }

    async fn load(&self, run: &RunId) -> Result<Vec<HistoryEvent>> {
        self.inner.load(run).await
    }

    async fn latest_run(&self, orchestration_id: &str) -> Result<Option<u32>> {
        self.inner.latest_run(orchestration_id).await
    }

    async fn runs(&self) -> Result<Vec<RunId>> {
        self.inner.runs().await
    }
}

/// Writes a batch file with `rows` valid start requests.
pub fn generate_requests_csv(path: &Path, rows: usize) -> std::result::Result<(), Error> {
    let mut wtr = csv::WriterBuilder::new().from_path(path)?;

    wtr.write_record(["customer_id", "amount", "wait_seconds", "orchestration_id"])?;
    for i in 1..=rows {
        wtr.write_record([
            format!("customer-{i}"),
            format!("{i}.50"),
            "0".to_string(),
            format!("batch-{i}"),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

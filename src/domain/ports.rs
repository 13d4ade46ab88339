use super::charge::{Amount, ChargeRecord, IdempotencyKey, OperationError, RecordOutcome};
use super::orchestration::{HistoryEvent, RunId};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// The sole arbiter of whether a charge has happened.
#[async_trait]
pub trait ChargeStore: Send + Sync {
    /// Inserts a record for `key` unless one already exists.
    ///
    /// The check and the insert are atomic: for any key exactly one call, ever,
    /// observes [`RecordOutcome::Created`]. A duplicate key is not an error.
    async fn record_charge(
        &self,
        key: &IdempotencyKey,
        customer_id: &str,
        amount: Amount,
    ) -> Result<RecordOutcome>;
    async fn get_charge(&self, key: &IdempotencyKey) -> Result<Option<ChargeRecord>>;
    /// All records, most recent first.
    async fn list_charges(&self) -> Result<Vec<ChargeRecord>>;
}

/// Append-only, per-run orchestration history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, run: &RunId, event: HistoryEvent) -> Result<()>;
    async fn load(&self, run: &RunId) -> Result<Vec<HistoryEvent>>;
    async fn latest_run(&self, orchestration_id: &str) -> Result<Option<u32>>;
    async fn runs(&self) -> Result<Vec<RunId>>;
}

/// The external payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        key: &IdempotencyKey,
        customer_id: &str,
        amount: Amount,
    ) -> std::result::Result<(), OperationError>;
}

pub type ChargeStoreHandle = Arc<dyn ChargeStore>;
pub type HistoryStoreHandle = Arc<dyn HistoryStore>;
pub type PaymentGatewayHandle = Arc<dyn PaymentGateway>;

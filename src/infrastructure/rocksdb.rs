use crate::domain::charge::{Amount, ChargeRecord, IdempotencyKey, RecordOutcome};
use crate::domain::orchestration::{HistoryEvent, RunId};
use crate::domain::ports::{ChargeStore, HistoryStore};
use crate::error::{ChargeError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Column Family for storing charge records keyed by idempotency key.
pub const CF_CHARGES: &str = "charges";
/// Column Family for storing orchestration history, one entry per run.
pub const CF_HISTORY: &str = "history";

/// A persistent store implementation using RocksDB.
///
/// Holds both the idempotent charge table and the orchestration history in
/// separate Column Families. RocksDB allows a single process to open a database, so
/// an in-process write lock is enough to make check-and-insert atomic.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families ("charges" and "history") exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_charges = ColumnFamilyDescriptor::new(CF_CHARGES, Options::default());
        let cf_history = ColumnFamilyDescriptor::new(CF_HISTORY, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_charges, cf_history])?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChargeError::StoreUnavailable(format!("{name} column family not found")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| ChargeError::StoreUnavailable("write lock poisoned".to_string()))
    }

    fn durable_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

fn history_prefix(orchestration_id: &str) -> Vec<u8> {
    let mut prefix = orchestration_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn history_key(run: &RunId) -> Vec<u8> {
    let mut key = history_prefix(&run.orchestration_id);
    key.extend_from_slice(&run.run.to_be_bytes());
    key
}

fn decode_history_key(key: &[u8]) -> Result<RunId> {
    let invalid = || ChargeError::StoreUnavailable("malformed history key".to_string());
    if key.len() < 5 || key[key.len() - 5] != 0 {
        return Err(invalid());
    }
    let (id, run) = key.split_at(key.len() - 5);
    let run: [u8; 4] = run[1..].try_into().map_err(|_| invalid())?;
    let orchestration_id = std::str::from_utf8(id).map_err(|_| invalid())?;
    Ok(RunId::new(orchestration_id, u32::from_be_bytes(run)))
}

#[async_trait]
impl ChargeStore for RocksDBStore {
    async fn record_charge(
        &self,
        key: &IdempotencyKey,
        customer_id: &str,
        amount: Amount,
    ) -> Result<RecordOutcome> {
        let cf = self.cf(CF_CHARGES)?;
        let _guard = self.lock()?;

        // Just check if the key exists without retrieving the value
        if self.db.get_pinned_cf(cf, key.as_str())?.is_some() {
            return Ok(RecordOutcome::AlreadyRecorded);
        }

        let record = ChargeRecord {
            idempotency_key: key.clone(),
            customer_id: customer_id.to_string(),
            amount: amount.value(),
            created_at: Utc::now(),
        };
        let value = serde_json::to_vec(&record)?;
        self.db
            .put_cf_opt(cf, key.as_str(), value, &Self::durable_writes())?;

        Ok(RecordOutcome::Created)
    }

    async fn get_charge(&self, key: &IdempotencyKey) -> Result<Option<ChargeRecord>> {
        let cf = self.cf(CF_CHARGES)?;
        match self.db.get_cf(cf, key.as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_charges(&self) -> Result<Vec<ChargeRecord>> {
        let cf = self.cf(CF_CHARGES)?;

        let mut charges = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let record: ChargeRecord = serde_json::from_slice(&value)?;
            charges.push(record);
        }

        charges.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(charges)
    }
}

#[async_trait]
impl HistoryStore for RocksDBStore {
    async fn append(&self, run: &RunId, event: HistoryEvent) -> Result<()> {
        let cf = self.cf(CF_HISTORY)?;
        let key = history_key(run);
        let _guard = self.lock()?;

        let mut events: Vec<HistoryEvent> = match self.db.get_cf(cf, &key)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        events.push(event);

        let value = serde_json::to_vec(&events)?;
        self.db.put_cf_opt(cf, &key, value, &Self::durable_writes())?;
        Ok(())
    }

    async fn load(&self, run: &RunId) -> Result<Vec<HistoryEvent>> {
        let cf = self.cf(CF_HISTORY)?;
        match self.db.get_cf(cf, history_key(run))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn latest_run(&self, orchestration_id: &str) -> Result<Option<u32>> {
        let cf = self.cf(CF_HISTORY)?;
        let prefix = history_prefix(orchestration_id);

        let mut latest = None;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward));
        for item in iter {
            let (key, _value) = item?;
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let run = decode_history_key(&key)?;
            if run.orchestration_id == orchestration_id {
                latest = Some(run.run);
            }
        }
        Ok(latest)
    }

    async fn runs(&self) -> Result<Vec<RunId>> {
        let cf = self.cf(CF_HISTORY)?;

        let mut runs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _value) = item?;
            runs.push(decode_history_key(&key)?);
        }
        Ok(runs)
    }
}

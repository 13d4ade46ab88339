use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChargeError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
    #[error("Orchestration {0} not found")]
    NotFound(String),
    #[error("Orchestration {0} is already running")]
    AlreadyRunning(String),
    #[error("Execution host unavailable: {0}")]
    HostUnavailable(String),
    #[error("Corrupt history for {0}: {1}")]
    CorruptHistory(String, String),
}

pub type Result<T> = std::result::Result<T, ChargeError>;

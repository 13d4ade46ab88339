use crate::error::ChargeError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Represents a positive monetary amount for a charge.
///
/// The inner decimal is normalized (`99.990` becomes `99.99`) so that equal
/// amounts always render, and therefore key, identically.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, ChargeError> {
        if value > Decimal::ZERO {
            Ok(Self(value.normalize()))
        } else {
            Err(ChargeError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = ChargeError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic identifier of one logical charge.
///
/// Rendered as `{customer_id}:{amount}:{orchestration_id}`. The same three inputs
/// always produce the same key; nothing random or time-based goes into it.
/// Customer ids containing `:` are rejected before a key is derived, so the first
/// `:` always ends the customer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(customer_id: &str, amount: Amount, orchestration_id: &str) -> Self {
        Self(format!("{customer_id}:{amount}:{orchestration_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A persisted charge, one per idempotency key for the lifetime of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub idempotency_key: IdempotencyKey,
    pub customer_id: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an atomic check-and-insert against the idempotent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This call created the record.
    Created,
    /// A record with the key already existed; nothing was written.
    AlreadyRecorded,
}

impl RecordOutcome {
    pub fn first_writer(self) -> bool {
        self == RecordOutcome::Created
    }
}

/// Input of a single Charge Operation invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub amount: Decimal,
    pub orchestration_id: String,
}

/// Output of a successful Charge Operation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeResult {
    pub charged: bool,
    pub idempotency_key: IdempotencyKey,
    pub already_processed: bool,
}

impl ChargeResult {
    pub fn from_outcome(idempotency_key: IdempotencyKey, outcome: RecordOutcome) -> Self {
        let charged = outcome.first_writer();
        Self {
            charged,
            idempotency_key,
            already_processed: !charged,
        }
    }
}

/// Failure of a Charge Operation invocation.
///
/// Persisted in orchestration history, hence serializable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum OperationError {
    /// Network or processor hiccup; eligible for retry.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Invalid input or a hard decline; retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl OperationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OperationError::Transient(_))
    }
}

impl From<ChargeError> for OperationError {
    fn from(err: ChargeError) -> Self {
        match err {
            ChargeError::ValidationError(msg) => OperationError::Permanent(msg),
            other => OperationError::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(ChargeError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(ChargeError::ValidationError(_))
        ));
    }

    #[test]
    fn test_key_format() {
        let amount = Amount::new(dec!(99.99)).unwrap();
        let key = IdempotencyKey::derive("customer-123", amount, "charge-workflow-1");
        assert_eq!(key.as_str(), "customer-123:99.99:charge-workflow-1");
    }

    #[test]
    fn test_key_is_deterministic() {
        let amount = Amount::new(dec!(12.5)).unwrap();
        let first = IdempotencyKey::derive("c-1", amount, "wf-1");
        for _ in 0..100 {
            let again = IdempotencyKey::derive("c-1", amount, "wf-1");
            assert_eq!(again.as_str().as_bytes(), first.as_str().as_bytes());
        }
    }

    #[test]
    fn test_key_ignores_trailing_zeros() {
        let a = IdempotencyKey::derive("c-1", Amount::new(dec!(99.990)).unwrap(), "wf");
        let b = IdempotencyKey::derive("c-1", Amount::new(dec!(99.99)).unwrap(), "wf");
        assert_eq!(a, b);
    }

    #[test]
    fn test_result_from_outcome() {
        let key = IdempotencyKey::from("k");
        let first = ChargeResult::from_outcome(key.clone(), RecordOutcome::Created);
        assert!(first.charged && !first.already_processed);

        let repeat = ChargeResult::from_outcome(key, RecordOutcome::AlreadyRecorded);
        assert!(!repeat.charged && repeat.already_processed);
    }

    #[test]
    fn test_store_unavailable_is_transient() {
        let err: OperationError = ChargeError::StoreUnavailable("disk".into()).into();
        assert!(err.is_retryable());

        let err: OperationError = ChargeError::ValidationError("bad".into()).into();
        assert!(!err.is_retryable());
    }
}

use crate::domain::charge::{Amount, ChargeRequest, ChargeResult, IdempotencyKey, OperationError};
use crate::domain::ports::{ChargeStoreHandle, PaymentGatewayHandle};
use tracing::{info, warn};

/// The side-effecting charge step.
///
/// Owns no state of its own: the store and the gateway are injected, and every
/// invocation with the same request derives the same key and converges on the same
/// store outcome, however many times it runs.
#[derive(Clone)]
pub struct ChargeOperation {
    store: ChargeStoreHandle,
    gateway: PaymentGatewayHandle,
}

impl ChargeOperation {
    /// Creates a new `ChargeOperation`.
    ///
    /// # Arguments
    ///
    /// * `store` - The idempotent store deciding whether a charge already happened.
    /// * `gateway` - The payment processor to call.
    pub fn new(store: ChargeStoreHandle, gateway: PaymentGatewayHandle) -> Self {
        Self { store, gateway }
    }

    pub fn store(&self) -> &ChargeStoreHandle {
        &self.store
    }

    /// Runs one invocation of the charge step.
    ///
    /// Invalid input is reported as [`OperationError::Permanent`]; processor and
    /// storage outages as [`OperationError::Transient`].
    pub async fn execute(&self, request: &ChargeRequest) -> Result<ChargeResult, OperationError> {
        if request.customer_id.trim().is_empty() {
            return Err(OperationError::Permanent(
                "customer_id must not be empty".to_string(),
            ));
        }
        // The key is ':'-delimited; the first ':' must end the customer id.
        if request.customer_id.contains(':') {
            return Err(OperationError::Permanent(format!(
                "customer_id must not contain ':' (got {:?})",
                request.customer_id
            )));
        }
        let amount = Amount::new(request.amount)?;
        let key = IdempotencyKey::derive(&request.customer_id, amount, &request.orchestration_id);

        info!(idempotency_key = %key, customer_id = %request.customer_id, %amount, "starting charge");

        self.gateway
            .charge(&key, &request.customer_id, amount)
            .await?;

        let outcome = self
            .store
            .record_charge(&key, &request.customer_id, amount)
            .await?;

        if outcome.first_writer() {
            info!(idempotency_key = %key, "charge recorded");
        } else {
            warn!(idempotency_key = %key, "charge already processed, skipping");
        }

        Ok(ChargeResult::from_outcome(key, outcome))
    }
}

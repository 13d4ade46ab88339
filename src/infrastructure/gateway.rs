use crate::domain::charge::{Amount, IdempotencyKey, OperationError};
use crate::domain::ports::PaymentGateway;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Stand-in for a payment processor call.
///
/// Each call suspends for `latency` and the first `fail_first` calls fail with a
/// transient error. Clones share the call counter.
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway {
    latency: Duration,
    fail_first: u32,
    calls: Arc<AtomicU32>,
}

impl SimulatedGateway {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Makes the first `n` calls fail transiently.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Makes every call fail transiently.
    pub fn always_failing(self) -> Self {
        self.failing_first(u32::MAX)
    }

    /// Number of calls made so far, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(
        &self,
        key: &IdempotencyKey,
        customer_id: &str,
        amount: Amount,
    ) -> Result<(), OperationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(idempotency_key = %key, customer_id, %amount, call, "calling payment processor");

        tokio::time::sleep(self.latency).await;

        if call <= self.fail_first {
            warn!(idempotency_key = %key, call, "payment processor unavailable");
            return Err(OperationError::Transient(format!(
                "payment processor unavailable (call {call})"
            )));
        }
        Ok(())
    }
}

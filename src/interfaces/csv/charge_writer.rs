use crate::domain::charge::ChargeRecord;
use crate::domain::orchestration::{OrchestrationFailure, OrchestrationOutcome};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// Flat CSV form of a terminal orchestration outcome.
#[derive(Debug, Serialize)]
struct OutcomeRow<'a> {
    orchestration_id: &'a str,
    status: String,
    charged: bool,
    already_processed: bool,
    idempotency_key: &'a str,
    attempts: Option<u32>,
    error: Option<String>,
}

impl<'a> OutcomeRow<'a> {
    fn new(orchestration_id: &'a str, outcome: &'a OrchestrationOutcome) -> Self {
        match outcome {
            OrchestrationOutcome::Completed { result } => Self {
                orchestration_id,
                status: outcome.status().to_string(),
                charged: result.charged,
                already_processed: result.already_processed,
                idempotency_key: result.idempotency_key.as_str(),
                attempts: None,
                error: None,
            },
            OrchestrationOutcome::Failed { failure } => Self {
                orchestration_id,
                status: outcome.status().to_string(),
                charged: false,
                already_processed: false,
                idempotency_key: "",
                attempts: Some(failure.attempts()),
                error: Some(match failure {
                    OrchestrationFailure::Operation { error, .. } => error.to_string(),
                    OrchestrationFailure::Cancelled {
                        last_error: None, ..
                    } => "cancelled".to_string(),
                    OrchestrationFailure::Cancelled {
                        last_error: Some(error),
                        ..
                    } => format!("cancelled; {error}"),
                }),
            },
        }
    }
}

/// Writes charges and orchestration outcomes as CSV.
pub struct ChargeWriter<W: Write> {
    writer: W,
}

impl<W: Write> ChargeWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes `idempotency_key,customer_id,amount,created_at` rows.
    pub fn write_charges(&mut self, charges: &[ChargeRecord]) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(&mut self.writer);
        if charges.is_empty() {
            wtr.write_record(["idempotency_key", "customer_id", "amount", "created_at"])?;
        }
        for charge in charges {
            wtr.serialize(charge)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Writes one row per `(orchestration_id, outcome)` pair.
    pub fn write_outcomes(&mut self, outcomes: &[(String, OrchestrationOutcome)]) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(&mut self.writer);
        if outcomes.is_empty() {
            wtr.write_record([
                "orchestration_id",
                "status",
                "charged",
                "already_processed",
                "idempotency_key",
                "attempts",
                "error",
            ])?;
        }
        for (orchestration_id, outcome) in outcomes {
            wtr.serialize(OutcomeRow::new(orchestration_id, outcome))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

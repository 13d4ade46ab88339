//! Application layer containing the orchestration host and the charge step.
//!
//! `ExecutionHost` drives each orchestration run in its own `tokio` task, persisting
//! every transition through the `HistoryStore` port. `ChargeOperation` is the single
//! side-effecting step, made safe to repeat by the idempotent `ChargeStore`.

pub mod clock;
pub mod host;
pub mod operation;

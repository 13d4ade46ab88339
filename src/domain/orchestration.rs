//! The charge orchestration as a replayable state machine.
//!
//! The orchestration never performs side effects itself. Its state is a fold over
//! the persisted [`HistoryEvent`]s of one run, and [`ChargeOrchestration::next_command`]
//! tells the host what to do next. Given the same history it always yields the same
//! command, which is what allows a restarted host to pick up a run exactly where the
//! previous process left it.

use super::charge::{ChargeResult, OperationError};
use super::retry::RetryPolicy;
use crate::error::{ChargeError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Immutable input of an orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeInput {
    pub customer_id: String,
    pub amount: Decimal,
    pub wait_seconds: u64,
}

/// One run of an orchestration id. Re-submitting a finished id starts run `n + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    pub orchestration_id: String,
    pub run: u32,
}

impl RunId {
    pub fn new(orchestration_id: impl Into<String>, run: u32) -> Self {
        Self {
            orchestration_id: orchestration_id.into(),
            run,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.orchestration_id, self.run)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Scheduled,
    Waiting,
    ExecutingOperation,
    Completed,
    Failed,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrchestrationStatus::Completed | OrchestrationStatus::Failed)
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestrationStatus::Scheduled => "Scheduled",
            OrchestrationStatus::Waiting => "Waiting",
            OrchestrationStatus::ExecutingOperation => "ExecutingOperation",
            OrchestrationStatus::Completed => "Completed",
            OrchestrationStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OrchestrationFailure {
    /// A permanent error, or the last transient error once attempts ran out.
    Operation { error: OperationError, attempts: u32 },
    /// A cancellation observed at a suspension point. Keeps the error of the
    /// last failed attempt, if any.
    Cancelled {
        attempts: u32,
        #[serde(default)]
        last_error: Option<OperationError>,
    },
}

impl OrchestrationFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            OrchestrationFailure::Operation { attempts, .. }
            | OrchestrationFailure::Cancelled { attempts, .. } => *attempts,
        }
    }
}

impl fmt::Display for OrchestrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationFailure::Operation { error, attempts } => {
                write!(f, "{error} after {attempts} attempt(s)")
            }
            OrchestrationFailure::Cancelled {
                attempts,
                last_error: None,
            } => write!(f, "cancelled after {attempts} attempt(s)"),
            OrchestrationFailure::Cancelled {
                attempts,
                last_error: Some(error),
            } => write!(f, "cancelled after {attempts} attempt(s), last error: {error}"),
        }
    }
}

/// Terminal result delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrchestrationOutcome {
    Completed { result: ChargeResult },
    Failed { failure: OrchestrationFailure },
}

impl OrchestrationOutcome {
    pub fn status(&self) -> OrchestrationStatus {
        match self {
            OrchestrationOutcome::Completed { .. } => OrchestrationStatus::Completed,
            OrchestrationOutcome::Failed { .. } => OrchestrationStatus::Failed,
        }
    }
}

/// A persisted state transition of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    Started {
        input: ChargeInput,
        retry_policy: RetryPolicy,
        at: DateTime<Utc>,
    },
    TimerScheduled {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        at: DateTime<Utc>,
    },
    CancelRequested {
        at: DateTime<Utc>,
    },
    AttemptStarted {
        attempt: u32,
        at: DateTime<Utc>,
    },
    AttemptFailed {
        attempt: u32,
        error: OperationError,
        at: DateTime<Utc>,
    },
    AttemptSucceeded {
        attempt: u32,
        result: ChargeResult,
        at: DateTime<Utc>,
    },
    Completed {
        result: ChargeResult,
        at: DateTime<Utc>,
    },
    Failed {
        failure: OrchestrationFailure,
        at: DateTime<Utc>,
    },
}

/// What the host must do next for a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Persist the durable timer deadline.
    StartTimer { fire_at: DateTime<Utc> },
    /// Suspend until the deadline, then record that the timer fired.
    AwaitTimer { fire_at: DateTime<Utc> },
    /// Invoke the charge operation, not earlier than `not_before` when set.
    InvokeCharge {
        attempt: u32,
        not_before: Option<DateTime<Utc>>,
    },
    /// Record the terminal success.
    Complete(ChargeResult),
    /// Record the terminal failure.
    Fail(OrchestrationFailure),
    /// Terminal; nothing left to do.
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
struct FailedAttempt {
    attempt: u32,
    error: OperationError,
    at: DateTime<Utc>,
}

/// Replayed view of one orchestration run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeOrchestration {
    run: RunId,
    input: ChargeInput,
    retry_policy: RetryPolicy,
    started_at: DateTime<Utc>,
    status: OrchestrationStatus,
    fire_at: Option<DateTime<Utc>>,
    attempts: u32,
    in_flight: Option<u32>,
    last_failure: Option<FailedAttempt>,
    succeeded: Option<ChargeResult>,
    cancel_requested: bool,
    outcome: Option<OrchestrationOutcome>,
}

impl ChargeOrchestration {
    /// Rebuilds the run state from its history. The first event must be `Started`.
    pub fn replay(run: RunId, history: &[HistoryEvent]) -> Result<Self> {
        let (first, rest) = history
            .split_first()
            .ok_or_else(|| corrupt(&run, "history is empty"))?;

        let HistoryEvent::Started {
            input,
            retry_policy,
            at,
        } = first
        else {
            return Err(corrupt(&run, "history does not begin with Started"));
        };

        let mut orchestration = Self {
            run,
            input: input.clone(),
            retry_policy: *retry_policy,
            started_at: *at,
            status: OrchestrationStatus::Scheduled,
            fire_at: None,
            attempts: 0,
            in_flight: None,
            last_failure: None,
            succeeded: None,
            cancel_requested: false,
            outcome: None,
        };

        for event in rest {
            orchestration.apply(event)?;
        }
        Ok(orchestration)
    }

    /// Folds one event into the state, rejecting transitions the state machine
    /// never produces.
    pub fn apply(&mut self, event: &HistoryEvent) -> Result<()> {
        match event {
            // A cancellation can race the final transition; it is a no-op once terminal.
            HistoryEvent::CancelRequested { .. } => {
                self.cancel_requested = true;
            }
            _ if self.status.is_terminal() => {
                return Err(corrupt(&self.run, "event recorded after terminal state"));
            }
            HistoryEvent::Started { .. } => {
                return Err(corrupt(&self.run, "duplicate Started event"));
            }
            HistoryEvent::TimerScheduled { fire_at } => {
                if self.status != OrchestrationStatus::Scheduled {
                    return Err(corrupt(&self.run, "timer scheduled outside Scheduled"));
                }
                self.fire_at = Some(*fire_at);
                self.status = OrchestrationStatus::Waiting;
            }
            HistoryEvent::TimerFired { .. } => {
                if self.status != OrchestrationStatus::Waiting {
                    return Err(corrupt(&self.run, "timer fired outside Waiting"));
                }
                self.status = OrchestrationStatus::ExecutingOperation;
            }
            HistoryEvent::AttemptStarted { attempt, .. } => {
                if self.status != OrchestrationStatus::ExecutingOperation {
                    return Err(corrupt(&self.run, "attempt started before timer fired"));
                }
                let resumed = self.in_flight == Some(*attempt);
                if !resumed && *attempt != self.attempts + 1 {
                    return Err(corrupt(
                        &self.run,
                        &format!("attempt {attempt} out of order after {}", self.attempts),
                    ));
                }
                self.attempts = *attempt;
                self.in_flight = Some(*attempt);
            }
            HistoryEvent::AttemptFailed { attempt, error, at } => {
                self.finish_attempt(*attempt)?;
                self.last_failure = Some(FailedAttempt {
                    attempt: *attempt,
                    error: error.clone(),
                    at: *at,
                });
            }
            HistoryEvent::AttemptSucceeded { attempt, result, .. } => {
                self.finish_attempt(*attempt)?;
                self.succeeded = Some(result.clone());
            }
            HistoryEvent::Completed { result, .. } => {
                self.status = OrchestrationStatus::Completed;
                self.in_flight = None;
                self.outcome = Some(OrchestrationOutcome::Completed {
                    result: result.clone(),
                });
            }
            HistoryEvent::Failed { failure, .. } => {
                self.status = OrchestrationStatus::Failed;
                self.in_flight = None;
                self.outcome = Some(OrchestrationOutcome::Failed {
                    failure: failure.clone(),
                });
            }
        }
        Ok(())
    }

    fn finish_attempt(&mut self, attempt: u32) -> Result<()> {
        if self.in_flight != Some(attempt) {
            return Err(corrupt(
                &self.run,
                &format!("outcome recorded for attempt {attempt} that is not in flight"),
            ));
        }
        self.in_flight = None;
        Ok(())
    }

    /// Decides the next step from the replayed state alone.
    pub fn next_command(&self) -> Command {
        match self.status {
            OrchestrationStatus::Completed | OrchestrationStatus::Failed => Command::Finished,
            OrchestrationStatus::Scheduled if self.cancel_requested => {
                Command::Fail(OrchestrationFailure::Cancelled {
                    attempts: 0,
                    last_error: None,
                })
            }
            OrchestrationStatus::Scheduled => Command::StartTimer {
                fire_at: offset(
                    self.started_at,
                    Duration::from_secs(self.input.wait_seconds),
                ),
            },
            OrchestrationStatus::Waiting if self.cancel_requested => {
                Command::Fail(OrchestrationFailure::Cancelled {
                    attempts: 0,
                    last_error: None,
                })
            }
            OrchestrationStatus::Waiting => Command::AwaitTimer {
                fire_at: self.fire_at.unwrap_or(self.started_at),
            },
            OrchestrationStatus::ExecutingOperation => self.next_operation_command(),
        }
    }

    fn next_operation_command(&self) -> Command {
        // A started attempt without an outcome means the process died mid-call.
        if let Some(attempt) = self.in_flight {
            return Command::InvokeCharge {
                attempt,
                not_before: None,
            };
        }

        if let Some(result) = &self.succeeded {
            return Command::Complete(result.clone());
        }

        let Some(failed) = &self.last_failure else {
            if self.cancel_requested {
                return Command::Fail(OrchestrationFailure::Cancelled {
                    attempts: 0,
                    last_error: None,
                });
            }
            return Command::InvokeCharge {
                attempt: 1,
                not_before: None,
            };
        };

        let exhausted = || {
            Command::Fail(OrchestrationFailure::Operation {
                error: failed.error.clone(),
                attempts: failed.attempt,
            })
        };

        if !failed.error.is_retryable() {
            return exhausted();
        }
        let Some(delay) = self.retry_policy.delay_after(failed.attempt) else {
            return exhausted();
        };
        if self.cancel_requested {
            return Command::Fail(OrchestrationFailure::Cancelled {
                attempts: failed.attempt,
                last_error: Some(failed.error.clone()),
            });
        }

        Command::InvokeCharge {
            attempt: failed.attempt + 1,
            not_before: Some(offset(failed.at, delay)),
        }
    }

    pub fn run(&self) -> &RunId {
        &self.run
    }

    pub fn input(&self) -> &ChargeInput {
        &self.input
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> OrchestrationStatus {
        self.status
    }

    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        self.fire_at
    }

    /// Number of charge attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn last_error(&self) -> Option<&OperationError> {
        self.last_failure.as_ref().map(|f| &f.error)
    }

    pub fn outcome(&self) -> Option<&OrchestrationOutcome> {
        self.outcome.as_ref()
    }
}

/// `at + delay`, saturating at the largest representable instant.
pub fn offset(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn corrupt(run: &RunId, reason: &str) -> ChargeError {
    ChargeError::CorruptHistory(run.to_string(), reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::charge::IdempotencyKey;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn started(wait_seconds: u64) -> HistoryEvent {
        HistoryEvent::Started {
            input: ChargeInput {
                customer_id: "customer-123".to_string(),
                amount: dec!(99.99),
                wait_seconds,
            },
            retry_policy: RetryPolicy::REFERENCE,
            at: t(0),
        }
    }

    fn replay(history: &[HistoryEvent]) -> ChargeOrchestration {
        ChargeOrchestration::replay(RunId::new("wf-1", 1), history).unwrap()
    }

    fn charged() -> ChargeResult {
        ChargeResult {
            charged: true,
            idempotency_key: IdempotencyKey::from("customer-123:99.99:wf-1"),
            already_processed: false,
        }
    }

    fn transient(attempt: u32, at: i64) -> HistoryEvent {
        HistoryEvent::AttemptFailed {
            attempt,
            error: OperationError::Transient("gateway timeout".into()),
            at: t(at),
        }
    }

    #[test]
    fn test_scheduled_starts_timer_from_original_start() {
        let orchestration = replay(&[started(10)]);
        assert_eq!(orchestration.status(), OrchestrationStatus::Scheduled);
        assert_eq!(
            orchestration.next_command(),
            Command::StartTimer { fire_at: t(10) }
        );
    }

    #[test]
    fn test_waiting_keeps_persisted_deadline() {
        let orchestration = replay(&[started(10), HistoryEvent::TimerScheduled { fire_at: t(10) }]);
        assert_eq!(orchestration.status(), OrchestrationStatus::Waiting);
        assert_eq!(
            orchestration.next_command(),
            Command::AwaitTimer { fire_at: t(10) }
        );
    }

    #[test]
    fn test_first_attempt_after_timer() {
        let orchestration = replay(&[
            started(10),
            HistoryEvent::TimerScheduled { fire_at: t(10) },
            HistoryEvent::TimerFired { at: t(10) },
        ]);
        assert_eq!(orchestration.status(), OrchestrationStatus::ExecutingOperation);
        assert_eq!(
            orchestration.next_command(),
            Command::InvokeCharge {
                attempt: 1,
                not_before: None
            }
        );
    }

    #[test]
    fn test_in_flight_attempt_is_reinvoked() {
        let orchestration = replay(&[
            started(0),
            HistoryEvent::TimerScheduled { fire_at: t(0) },
            HistoryEvent::TimerFired { at: t(0) },
            HistoryEvent::AttemptStarted { attempt: 1, at: t(0) },
        ]);
        assert_eq!(
            orchestration.next_command(),
            Command::InvokeCharge {
                attempt: 1,
                not_before: None
            }
        );
    }

    #[test]
    fn test_retry_backoff_and_exhaustion() {
        let mut history = vec![
            started(0),
            HistoryEvent::TimerScheduled { fire_at: t(0) },
            HistoryEvent::TimerFired { at: t(0) },
            HistoryEvent::AttemptStarted { attempt: 1, at: t(0) },
            transient(1, 1),
        ];
        assert_eq!(
            replay(&history).next_command(),
            Command::InvokeCharge {
                attempt: 2,
                not_before: Some(t(6))
            }
        );

        history.push(HistoryEvent::AttemptStarted { attempt: 2, at: t(6) });
        history.push(transient(2, 7));
        assert_eq!(
            replay(&history).next_command(),
            Command::InvokeCharge {
                attempt: 3,
                not_before: Some(t(17))
            }
        );

        history.push(HistoryEvent::AttemptStarted { attempt: 3, at: t(17) });
        history.push(transient(3, 18));
        assert_eq!(
            replay(&history).next_command(),
            Command::Fail(OrchestrationFailure::Operation {
                error: OperationError::Transient("gateway timeout".into()),
                attempts: 3,
            })
        );
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let orchestration = replay(&[
            started(0),
            HistoryEvent::TimerScheduled { fire_at: t(0) },
            HistoryEvent::TimerFired { at: t(0) },
            HistoryEvent::AttemptStarted { attempt: 1, at: t(0) },
            HistoryEvent::AttemptFailed {
                attempt: 1,
                error: OperationError::Permanent("Amount must be positive".into()),
                at: t(0),
            },
        ]);
        assert!(matches!(
            orchestration.next_command(),
            Command::Fail(OrchestrationFailure::Operation { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_success_completes() {
        let history = vec![
            started(0),
            HistoryEvent::TimerScheduled { fire_at: t(0) },
            HistoryEvent::TimerFired { at: t(0) },
            HistoryEvent::AttemptStarted { attempt: 1, at: t(0) },
            HistoryEvent::AttemptSucceeded {
                attempt: 1,
                result: charged(),
                at: t(5),
            },
        ];
        assert_eq!(replay(&history).next_command(), Command::Complete(charged()));

        let mut done = history.clone();
        done.push(HistoryEvent::Completed {
            result: charged(),
            at: t(5),
        });
        let orchestration = replay(&done);
        assert_eq!(orchestration.status(), OrchestrationStatus::Completed);
        assert_eq!(orchestration.next_command(), Command::Finished);
        assert_eq!(
            orchestration.outcome(),
            Some(&OrchestrationOutcome::Completed { result: charged() })
        );
    }

    #[test]
    fn test_cancel_observed_while_waiting() {
        let orchestration = replay(&[
            started(60),
            HistoryEvent::TimerScheduled { fire_at: t(60) },
            HistoryEvent::CancelRequested { at: t(5) },
        ]);
        assert_eq!(
            orchestration.next_command(),
            Command::Fail(OrchestrationFailure::Cancelled {
                attempts: 0,
                last_error: None,
            })
        );
    }

    #[test]
    fn test_cancel_does_not_preempt_in_flight_attempt() {
        let history = vec![
            started(0),
            HistoryEvent::TimerScheduled { fire_at: t(0) },
            HistoryEvent::TimerFired { at: t(0) },
            HistoryEvent::AttemptStarted { attempt: 1, at: t(0) },
            HistoryEvent::CancelRequested { at: t(1) },
        ];
        assert!(matches!(
            replay(&history).next_command(),
            Command::InvokeCharge { attempt: 1, .. }
        ));

        let mut failed = history.clone();
        failed.push(transient(1, 2));
        assert_eq!(
            replay(&failed).next_command(),
            Command::Fail(OrchestrationFailure::Cancelled {
                attempts: 1,
                last_error: Some(OperationError::Transient("gateway timeout".into())),
            })
        );
    }

    #[test]
    fn test_replay_is_deterministic() {
        let history = vec![
            started(3),
            HistoryEvent::TimerScheduled { fire_at: t(3) },
            HistoryEvent::TimerFired { at: t(3) },
            HistoryEvent::AttemptStarted { attempt: 1, at: t(3) },
            transient(1, 4),
        ];
        let first = replay(&history);
        for _ in 0..10 {
            let again = replay(&history);
            assert_eq!(again, first);
            assert_eq!(again.next_command(), first.next_command());
        }
    }

    #[test]
    fn test_corrupt_histories_are_rejected() {
        let run = RunId::new("wf-1", 1);
        assert!(ChargeOrchestration::replay(run.clone(), &[]).is_err());
        assert!(
            ChargeOrchestration::replay(run.clone(), &[HistoryEvent::TimerFired { at: t(0) }])
                .is_err()
        );
        assert!(
            ChargeOrchestration::replay(
                run.clone(),
                &[
                    started(0),
                    HistoryEvent::TimerScheduled { fire_at: t(0) },
                    HistoryEvent::TimerFired { at: t(0) },
                    HistoryEvent::AttemptStarted { attempt: 2, at: t(0) },
                ]
            )
            .is_err()
        );
        assert!(
            ChargeOrchestration::replay(
                run,
                &[
                    started(0),
                    HistoryEvent::Failed {
                        failure: OrchestrationFailure::Cancelled {
                            attempts: 0,
                            last_error: None,
                        },
                        at: t(0)
                    },
                    HistoryEvent::TimerScheduled { fire_at: t(0) },
                ]
            )
            .is_err()
        );
    }
}

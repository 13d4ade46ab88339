use super::clock::HostClock;
use super::operation::ChargeOperation;
use crate::config::HostSettings;
use crate::domain::charge::ChargeRequest;
use crate::domain::orchestration::{
    ChargeInput, ChargeOrchestration, Command, HistoryEvent, OrchestrationOutcome, RunId,
};
use crate::domain::ports::HistoryStoreHandle;
use crate::domain::retry::RetryPolicy;
use crate::error::{ChargeError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// A request to start a charge orchestration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartRequest {
    pub customer_id: String,
    pub amount: Decimal,
    pub wait_seconds: u64,
    /// Reusing the id of a finished orchestration starts a new run of it.
    #[serde(default)]
    pub orchestration_id: Option<String>,
}

/// How a driven run ended in this process.
#[derive(Debug, Clone)]
enum RunEnd {
    Finished(OrchestrationOutcome),
    /// History could not be read or written; the run stays resumable.
    Stalled(String),
}

/// Host-wide configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Policy recorded into every new run. Runs keep the policy they started with.
    pub retry_policy: RetryPolicy,
    pub max_concurrent_operations: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from(&HostSettings::default())
    }
}

impl From<&HostSettings> for HostConfig {
    fn from(settings: &HostSettings) -> Self {
        Self {
            retry_policy: settings.retry_policy,
            max_concurrent_operations: settings.max_concurrent_operations.max(1),
        }
    }
}

/// In-process execution host for charge orchestrations.
///
/// Every run is driven by its own tokio task. Before each step the task replays the
/// run's persisted history and asks the state machine for the next command, so a
/// new host over the same stores continues exactly where a dead one stopped.
/// Waits are `tokio` sleeps; they never hold a worker thread.
///
/// Dropping the host aborts its tasks, which is indistinguishable from the process
/// dying: whatever was persisted is all a successor sees.
pub struct ExecutionHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    history: HistoryStoreHandle,
    operation: ChargeOperation,
    clock: HostClock,
    config: HostConfig,
    permits: Semaphore,
    tasks: Mutex<HashMap<RunId, JoinHandle<()>>>,
    wakeups: Mutex<HashMap<RunId, Arc<Notify>>>,
    outcomes: broadcast::Sender<(RunId, RunEnd)>,
    stalled: Mutex<HashMap<RunId, String>>,
    submissions: tokio::sync::Mutex<()>,
}

impl ExecutionHost {
    /// Creates a new `ExecutionHost`.
    ///
    /// # Arguments
    ///
    /// * `history` - Where every state transition is persisted.
    /// * `operation` - The charge step, with its store and gateway injected.
    /// * `clock` - Source of timestamps; share it between hosts that stand in for
    ///   restarts of the same process.
    /// * `config` - Retry policy and concurrency limits.
    pub fn new(
        history: HistoryStoreHandle,
        operation: ChargeOperation,
        clock: HostClock,
        config: HostConfig,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HostInner {
                history,
                operation,
                clock,
                permits: Semaphore::new(config.max_concurrent_operations.max(1)),
                config,
                tasks: Mutex::new(HashMap::new()),
                wakeups: Mutex::new(HashMap::new()),
                outcomes,
                stalled: Mutex::new(HashMap::new()),
                submissions: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Starts a new orchestration run and returns its orchestration id.
    pub async fn submit(&self, request: StartRequest) -> Result<String> {
        let inner = &self.inner;
        let orchestration_id = request
            .orchestration_id
            .unwrap_or_else(|| format!("charge-workflow-{}", Uuid::new_v4()));
        if orchestration_id.trim().is_empty() {
            return Err(ChargeError::ValidationError(
                "orchestration_id must not be empty".to_string(),
            ));
        }

        let _guard = inner.submissions.lock().await;

        let run = match inner.history.latest_run(&orchestration_id).await? {
            Some(latest) => {
                let previous = inner.replay(&RunId::new(&orchestration_id, latest)).await?;
                if !previous.status().is_terminal() {
                    return Err(ChargeError::AlreadyRunning(orchestration_id));
                }
                latest + 1
            }
            None => 1,
        };
        let run = RunId::new(&orchestration_id, run);

        let input = ChargeInput {
            customer_id: request.customer_id,
            amount: request.amount,
            wait_seconds: request.wait_seconds,
        };
        info!(
            orchestration_id = %run.orchestration_id,
            run = run.run,
            customer_id = %input.customer_id,
            amount = %input.amount,
            wait_seconds = input.wait_seconds,
            "orchestration submitted"
        );
        inner
            .history
            .append(
                &run,
                HistoryEvent::Started {
                    input,
                    retry_policy: inner.config.retry_policy,
                    at: inner.clock.now(),
                },
            )
            .await?;

        self.spawn(run);
        Ok(orchestration_id)
    }

    /// Picks up every run that has not reached a terminal state.
    pub async fn resume(&self) -> Result<Vec<RunId>> {
        let mut resumed = Vec::new();
        for run in self.inner.history.runs().await? {
            match self.inner.replay(&run).await {
                Ok(orchestration) if !orchestration.status().is_terminal() => {
                    info!(
                        orchestration_id = %run.orchestration_id,
                        run = run.run,
                        status = %orchestration.status(),
                        "resuming orchestration"
                    );
                    self.spawn(run.clone());
                    resumed.push(run);
                }
                Ok(_) => {}
                Err(err) => {
                    error!(orchestration_id = %run.orchestration_id, run = run.run, error = %err, "cannot resume");
                }
            }
        }
        Ok(resumed)
    }

    /// Requests cancellation of the latest run of `orchestration_id`.
    ///
    /// Returns `false` if the run had already finished. The request takes effect at
    /// the next suspension point; an in-flight charge is never interrupted.
    pub async fn cancel(&self, orchestration_id: &str) -> Result<bool> {
        let run = self.latest_run(orchestration_id).await?;
        let orchestration = self.inner.replay(&run).await?;
        if orchestration.status().is_terminal() {
            return Ok(false);
        }

        self.inner
            .history
            .append(
                &run,
                HistoryEvent::CancelRequested {
                    at: self.inner.clock.now(),
                },
            )
            .await?;
        info!(orchestration_id = %run.orchestration_id, run = run.run, "cancellation requested");

        if let Some(wakeup) = self.inner.wakeup(&run) {
            wakeup.notify_one();
        }
        Ok(true)
    }

    /// Waits until the latest run of `orchestration_id` reaches a terminal state.
    ///
    /// Fails with [`ChargeError::HostUnavailable`] if this host stopped driving the
    /// run because its history store kept failing. The run can then be resumed.
    pub async fn wait_for_outcome(&self, orchestration_id: &str) -> Result<OrchestrationOutcome> {
        // Subscribe before reading history so no completion slips in between.
        let mut outcomes = self.inner.outcomes.subscribe();
        let run = self.latest_run(orchestration_id).await?;

        if let Some(outcome) = self.inner.replay(&run).await?.outcome() {
            return Ok(outcome.clone());
        }
        self.inner.check_stalled(&run)?;

        loop {
            match outcomes.recv().await {
                Ok((ended, RunEnd::Finished(outcome))) if ended == run => return Ok(outcome),
                Ok((ended, RunEnd::Stalled(reason))) if ended == run => {
                    return Err(stalled_error(&run, &reason));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "outcome subscriber lagged, rechecking history");
                    if let Some(outcome) = self.inner.replay(&run).await?.outcome() {
                        return Ok(outcome.clone());
                    }
                    self.inner.check_stalled(&run)?;
                }
                Err(RecvError::Closed) => {
                    return Err(ChargeError::HostUnavailable(
                        "outcome channel closed".to_string(),
                    ));
                }
            }
        }
    }

    /// Replayed view of the latest run of `orchestration_id`.
    pub async fn status(&self, orchestration_id: &str) -> Result<ChargeOrchestration> {
        let run = self.latest_run(orchestration_id).await?;
        self.inner.replay(&run).await
    }

    /// Persisted history of one run.
    pub async fn history(&self, run: &RunId) -> Result<Vec<HistoryEvent>> {
        self.inner.history.load(run).await
    }

    pub async fn latest_run(&self, orchestration_id: &str) -> Result<RunId> {
        self.inner
            .history
            .latest_run(orchestration_id)
            .await?
            .map(|run| RunId::new(orchestration_id, run))
            .ok_or_else(|| ChargeError::NotFound(orchestration_id.to_string()))
    }

    /// Number of runs this host is currently driving.
    pub fn active_runs(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }

    /// Stops driving all runs immediately. Persisted state is left untouched, so a
    /// later host can resume them.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for (run, task) in tasks.drain() {
                if !task.is_finished() {
                    debug!(orchestration_id = %run.orchestration_id, run = run.run, "aborting orchestration task");
                }
                task.abort();
            }
        }
        if let Ok(mut wakeups) = self.inner.wakeups.lock() {
            wakeups.clear();
        }
    }

    fn spawn(&self, run: RunId) {
        let Ok(mut tasks) = self.inner.tasks.lock() else {
            error!(orchestration_id = %run.orchestration_id, "task registry poisoned");
            return;
        };
        if tasks.get(&run).is_some_and(|task| !task.is_finished()) {
            return;
        }

        let wakeup = Arc::new(Notify::new());
        if let Ok(mut wakeups) = self.inner.wakeups.lock() {
            wakeups.insert(run.clone(), wakeup.clone());
        }
        if let Ok(mut stalled) = self.inner.stalled.lock() {
            stalled.remove(&run);
        }

        let inner = self.inner.clone();
        let span = info_span!("orchestration", orchestration_id = %run.orchestration_id, run = run.run);
        let task_run = run.clone();
        let task = tokio::spawn(
            async move {
                if let Err(err) = inner.drive(&task_run, &wakeup).await {
                    error!(error = %err, "orchestration stalled");
                    inner.mark_stalled(&task_run, err.to_string());
                }
                inner.release(&task_run);
            }
            .instrument(span),
        );
        tasks.insert(run, task);
    }
}

impl Drop for ExecutionHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl HostInner {
    async fn replay(&self, run: &RunId) -> Result<ChargeOrchestration> {
        let history = self.history.load(run).await?;
        if history.is_empty() {
            return Err(ChargeError::NotFound(run.to_string()));
        }
        ChargeOrchestration::replay(run.clone(), &history)
    }

    fn wakeup(&self, run: &RunId) -> Option<Arc<Notify>> {
        self.wakeups.lock().ok()?.get(run).cloned()
    }

    /// Suspends until `deadline`. Returns `false` when woken early by a
    /// cancellation request.
    async fn suspend_until(&self, deadline: DateTime<Utc>, wakeup: &Notify) -> bool {
        tokio::select! {
            _ = self.clock.sleep_until(deadline) => true,
            _ = wakeup.notified() => false,
        }
    }

    async fn drive(&self, run: &RunId, wakeup: &Notify) -> Result<()> {
        loop {
            let orchestration = self
                .with_history_retry("replay", || self.replay(run))
                .await?;

            match orchestration.next_command() {
                Command::StartTimer { fire_at } => {
                    info!(%fire_at, "waiting before charge");
                    self.record(run, HistoryEvent::TimerScheduled { fire_at })
                        .await?;
                }
                Command::AwaitTimer { fire_at } => {
                    if self.suspend_until(fire_at, wakeup).await {
                        let at = self.clock.now();
                        info!(%at, "wait completed");
                        self.record(run, HistoryEvent::TimerFired { at }).await?;
                    }
                }
                Command::InvokeCharge {
                    attempt,
                    not_before,
                } => {
                    if let Some(not_before) = not_before {
                        debug!(attempt, %not_before, "backing off before retry");
                        if !self.suspend_until(not_before, wakeup).await {
                            continue;
                        }
                    }
                    self.invoke_charge(run, &orchestration, attempt).await?;
                }
                Command::Complete(result) => {
                    info!(
                        charged = result.charged,
                        already_processed = result.already_processed,
                        idempotency_key = %result.idempotency_key,
                        "orchestration completed"
                    );
                    let at = self.clock.now();
                    self.record(run, HistoryEvent::Completed { result, at })
                        .await?;
                }
                Command::Fail(failure) => {
                    warn!(error = %failure, "orchestration failed");
                    let at = self.clock.now();
                    self.record(run, HistoryEvent::Failed { failure, at })
                        .await?;
                }
                Command::Finished => {
                    if let Some(outcome) = orchestration.outcome() {
                        // Nobody listening is fine.
                        let _ = self
                            .outcomes
                            .send((run.clone(), RunEnd::Finished(outcome.clone())));
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn invoke_charge(
        &self,
        run: &RunId,
        orchestration: &ChargeOrchestration,
        attempt: u32,
    ) -> Result<()> {
        let request = ChargeRequest {
            customer_id: orchestration.input().customer_id.clone(),
            amount: orchestration.input().amount,
            orchestration_id: run.orchestration_id.clone(),
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ChargeError::HostUnavailable("operation permits closed".to_string()))?;

        info!(attempt, "invoking charge operation");
        self.record(
            run,
            HistoryEvent::AttemptStarted {
                attempt,
                at: self.clock.now(),
            },
        )
        .await?;

        let event = match self.operation.execute(&request).await {
            Ok(result) => HistoryEvent::AttemptSucceeded {
                attempt,
                result,
                at: self.clock.now(),
            },
            Err(error) => {
                warn!(attempt, error = %error, retryable = error.is_retryable(), "charge attempt failed");
                HistoryEvent::AttemptFailed {
                    attempt,
                    error,
                    at: self.clock.now(),
                }
            }
        };
        self.record(run, event).await
    }

    /// Appends `event` to the run's history, retrying store failures.
    async fn record(&self, run: &RunId, event: HistoryEvent) -> Result<()> {
        let history = &self.history;
        self.with_history_retry("append", move || history.append(run, event.clone()))
            .await
    }

    /// Runs a history access under [`RetryPolicy::HISTORY_ACCESS`]. Corrupt history
    /// is returned at once.
    async fn with_history_retry<T, F, Fut>(&self, what: &str, mut access: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy::HISTORY_ACCESS;
        let mut attempt = 1;
        loop {
            match access().await {
                Ok(value) => return Ok(value),
                Err(err @ ChargeError::CorruptHistory(..)) => return Err(err),
                Err(err) => {
                    let Some(delay) = policy.delay_after(attempt) else {
                        return Err(err);
                    };
                    warn!(attempt, error = %err, ?delay, "history {} failed, retrying", what);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn mark_stalled(&self, run: &RunId, reason: String) {
        if let Ok(mut stalled) = self.stalled.lock() {
            stalled.insert(run.clone(), reason.clone());
        }
        let _ = self.outcomes.send((run.clone(), RunEnd::Stalled(reason)));
    }

    fn check_stalled(&self, run: &RunId) -> Result<()> {
        let reason = self.stalled.lock().ok().and_then(|stalled| stalled.get(run).cloned());
        match reason {
            Some(reason) => Err(stalled_error(run, &reason)),
            None => Ok(()),
        }
    }

    /// Drops the bookkeeping of a run whose task is ending.
    fn release(&self, run: &RunId) {
        if let Ok(mut wakeups) = self.wakeups.lock() {
            wakeups.remove(run);
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            // A later `spawn` may already have replaced this task's handle.
            let current = tokio::task::id();
            if tasks.get(run).is_some_and(|task| task.id() == current) {
                tasks.remove(run);
            }
        }
    }
}

fn stalled_error(run: &RunId, reason: &str) -> ChargeError {
    ChargeError::HostUnavailable(format!("{run} stalled: {reason}"))
}

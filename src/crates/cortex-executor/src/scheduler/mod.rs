//! Wave-diagnosed, dependency-driven action scheduler
//!
//! Executes one validated [`ActionGraph`] to completion. Launch policy: an
//! action is spawned the moment its dependencies are satisfied; a semaphore
//! sized to `max_parallel` gates actual execution, so later-wave actions may
//! start before earlier-wave peers finish as long as their own dependencies
//! are complete. The wave partition is used for launch-order tie-breaks and
//! diagnostics only.
//!
//! Workers report completions over a channel of `ActionResult`s; the
//! scheduler loop binds each result into the store *before* releasing
//! dependents, which is the happens-before edge readers rely on. Parameters
//! are resolved at dispatch time, not parse time, so a dependent always
//! reads the latest bound value even after retries.
//!
//! Failure semantics: a terminal failure marks every transitively dependent
//! non-fire-and-forget action `skipped`, unless the failing action opted
//! into `skip_on_error`, in which case its result is bound as null and
//! dependents run. Fire-and-forget actions are launched, hold an execution
//! slot while running, and are never tracked or awaited; their failures
//! surface only as events.

pub mod internal;

use crate::cancel::CancelHandle;
use crate::emitter::EventEmitter;
use crate::invoker::{ActionInvoker, Invocation, InvokeOutcome};
use chrono::Utc;
use cortex_core::action::{Action, ActionFailure, ActionKind, ActionResult, ActionStatus, RetryPolicy};
use cortex_core::config::ExecutionConfig;
use cortex_core::error::{CoreError, Result};
use cortex_core::event::EventKind;
use cortex_core::graph::ActionGraph;
use cortex_core::resolver;
use cortex_core::store::ResultStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// How long the scheduler waits for in-flight actions to observe
/// cancellation before synthesizing cancelled results.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Per-iteration memory of `$name` references already warned about.
#[derive(Default)]
pub struct MissingRefWarnings {
    seen: Mutex<HashSet<String>>,
}

impl MissingRefWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per unique name.
    pub fn first_time(&self, name: &str) -> bool {
        self.seen.lock().insert(name.to_string())
    }
}

/// Aggregate outcome of one graph execution
#[derive(Debug, Default)]
pub struct SchedulerReport {
    /// Terminal results of tracked (non-fire-and-forget) actions
    pub results: HashMap<String, ActionResult>,
    pub fire_and_forget_launched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// First action to reach a failure state, in completion order
    pub first_failed: Option<String>,
}

impl SchedulerReport {
    fn record(&mut self, result: ActionResult) {
        match result.status {
            ActionStatus::Success => self.succeeded += 1,
            ActionStatus::Skipped => self.skipped += 1,
            ActionStatus::Cancelled => self.cancelled += 1,
            ActionStatus::Error | ActionStatus::Timeout => self.failed += 1,
        }
        if result.status.is_failure() && self.first_failed.is_none() {
            self.first_failed = Some(result.action_id.clone());
        }
        self.results.insert(result.action_id.clone(), result);
    }

    /// Terminal results in no particular order.
    pub fn into_results(self) -> Vec<ActionResult> {
        self.results.into_values().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Waiting,
    Launched,
    Done,
}

/// Executes validated action graphs against the callable seam
pub struct DagScheduler {
    invoker: Arc<dyn ActionInvoker>,
    store: Arc<ResultStore>,
    emitter: EventEmitter,
    cancel: CancelHandle,
    config: ExecutionConfig,
}

impl DagScheduler {
    pub fn new(
        invoker: Arc<dyn ActionInvoker>,
        store: Arc<ResultStore>,
        emitter: EventEmitter,
        cancel: CancelHandle,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            invoker,
            store,
            emitter,
            cancel,
            config,
        }
    }

    /// Run every action in the graph to a terminal state (or cancellation).
    pub async fn run(
        &self,
        graph: &ActionGraph,
        warned: Arc<MissingRefWarnings>,
    ) -> Result<SchedulerReport> {
        let mut report = SchedulerReport::default();
        if graph.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let (done_tx, mut done_rx) = mpsc::channel::<ActionResult>(graph.len());

        let mut state: HashMap<String, NodeState> = graph
            .actions()
            .iter()
            .map(|a| (a.id.clone(), NodeState::Waiting))
            .collect();
        let mut remaining: HashMap<String, usize> = graph
            .actions()
            .iter()
            .map(|a| (a.id.clone(), a.depends_on.len()))
            .collect();
        let mut tracked_outstanding = graph
            .actions()
            .iter()
            .filter(|a| !a.mode.is_fire_and_forget())
            .count();

        let mut cancelling = self.cancel.is_cancelled();
        if cancelling {
            self.cancel_waiting(graph, &mut state, &mut report, &mut tracked_outstanding)
                .await;
        } else {
            let roots: Vec<String> = graph
                .actions()
                .iter()
                .filter(|a| a.depends_on.is_empty())
                .map(|a| a.id.clone())
                .collect();
            self.launch(
                graph,
                roots,
                &mut state,
                &mut report,
                &semaphore,
                &done_tx,
                &warned,
            );
        }

        while tracked_outstanding > 0 {
            let received = if cancelling {
                match tokio::time::timeout(CANCEL_GRACE, done_rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => None,
                }
            } else {
                tokio::select! {
                    received = done_rx.recv() => received,
                    _ = self.cancel.cancelled() => {
                        cancelling = true;
                        self.cancel_waiting(graph, &mut state, &mut report, &mut tracked_outstanding)
                            .await;
                        continue;
                    }
                }
            };

            let Some(result) = received else {
                if cancelling {
                    // Grace expired: in-flight workers did not report back.
                    self.synthesize_cancelled(graph, &mut state, &mut report, &mut tracked_outstanding)
                        .await;
                    break;
                }
                return Err(CoreError::Internal(
                    "scheduler completion channel closed with work outstanding".to_string(),
                ));
            };

            let newly_ready = self
                .complete(graph, result, &mut state, &mut remaining, &mut report, &mut tracked_outstanding)
                .await;

            if !cancelling {
                self.launch(
                    graph,
                    newly_ready,
                    &mut state,
                    &mut report,
                    &semaphore,
                    &done_tx,
                    &warned,
                );
            }
        }

        Ok(report)
    }

    /// Bind one terminal result into the store, then work out which
    /// dependents become ready (or get skipped).
    async fn complete(
        &self,
        graph: &ActionGraph,
        result: ActionResult,
        state: &mut HashMap<String, NodeState>,
        remaining: &mut HashMap<String, usize>,
        report: &mut SchedulerReport,
        tracked_outstanding: &mut usize,
    ) -> Vec<String> {
        let id = result.action_id.clone();
        let Some(action) = graph.get(&id) else {
            warn!(action_id = %id, "completion for unknown action");
            return Vec::new();
        };

        state.insert(id.clone(), NodeState::Done);
        *tracked_outstanding = tracked_outstanding.saturating_sub(1);

        let release_dependents = match result.status {
            ActionStatus::Success => {
                let output = result.output.clone().unwrap_or(Value::Null);
                self.store
                    .bind_result(&id, action.output_key.as_deref(), output);
                true
            }
            _ if action.skip_on_error => {
                // Dependents observe `$name` as null instead of being
                // skipped.
                self.store.bind_null(&id, action.output_key.as_deref());
                true
            }
            _ => false,
        };

        // The worker already emitted the terminal event (under its permit).
        report.record(result);

        if release_dependents {
            let mut ready = Vec::new();
            for dependent in graph.dependents_of(&id) {
                let left = remaining
                    .get_mut(dependent)
                    .expect("dependent is a graph member");
                *left = left.saturating_sub(1);
                if *left == 0 && state.get(dependent) == Some(&NodeState::Waiting) {
                    ready.push(dependent.clone());
                }
            }
            ready
        } else {
            // Terminal failure without skip_on_error: the whole transitive
            // closure is skipped, never executed.
            let mut closure: Vec<String> = graph
                .transitive_dependents(&id)
                .into_iter()
                .filter(|t| state.get(t) == Some(&NodeState::Waiting))
                .collect();
            closure.sort_by_key(|t| graph.ordinal(t));

            for skipped_id in closure {
                state.insert(skipped_id.clone(), NodeState::Done);
                let skipped = ActionResult::skipped(
                    &skipped_id,
                    format!("dependency '{}' ended {}", id, report.results[&id].status),
                );
                self.emit_terminal(&skipped).await;
                let is_tracked = graph
                    .get(&skipped_id)
                    .map(|a| !a.mode.is_fire_and_forget())
                    .unwrap_or(false);
                if is_tracked {
                    *tracked_outstanding = tracked_outstanding.saturating_sub(1);
                    report.record(skipped);
                }
            }
            Vec::new()
        }
    }

    /// Spawn ready actions, wave then parse order, gated by the semaphore.
    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        graph: &ActionGraph,
        mut ready: Vec<String>,
        state: &mut HashMap<String, NodeState>,
        report: &mut SchedulerReport,
        semaphore: &Arc<Semaphore>,
        done_tx: &mpsc::Sender<ActionResult>,
        warned: &Arc<MissingRefWarnings>,
    ) {
        ready.sort_by_key(|id| (graph.wave_of(id), graph.ordinal(id)));

        for id in ready {
            let Some(action) = graph.get(&id) else { continue };
            state.insert(id.clone(), NodeState::Launched);

            let tracked = !action.mode.is_fire_and_forget();
            if !tracked {
                report.fire_and_forget_launched += 1;
            }
            debug!(
                action_id = %id,
                wave = graph.wave_of(&id),
                mode = %action.mode,
                "launching action"
            );

            self.spawn_worker(action.clone(), tracked, semaphore.clone(), done_tx.clone(), warned.clone());
        }
    }

    fn spawn_worker(
        &self,
        action: Action,
        tracked: bool,
        semaphore: Arc<Semaphore>,
        done_tx: mpsc::Sender<ActionResult>,
        warned: Arc<MissingRefWarnings>,
    ) {
        let invoker = Arc::clone(&self.invoker);
        let store = Arc::clone(&self.store);
        let emitter = self.emitter.clone();
        let cancel = self.cancel.clone();
        let timeout_ms = action.timeout_ms.unwrap_or(self.config.default_action_timeout_ms);
        let retry = action
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };

            // READY -> CANCELLED: a slot freed up after cancellation.
            if cancel.is_cancelled() {
                let result = ActionResult::cancelled(&action.id);
                emit_terminal_event(&emitter, &result).await;
                if tracked {
                    let _ = done_tx.send(result).await;
                }
                return;
            }

            // Dispatch-time substitution: dependents read the latest bound
            // results even when a dependency was retried.
            let refs = resolver::collect_refs(&action.parameters);
            let bindings = store.bindings_for(&refs).await;
            let resolution = resolver::resolve_value(&action.parameters, &bindings);
            for name in &resolution.missing {
                if warned.first_time(name) {
                    emitter
                        .emit(EventKind::action_warning(
                            "missing_reference",
                            format!("no binding for '${}'; left literal", name),
                            &action.id,
                        ))
                        .await;
                }
            }

            emitter
                .emit(EventKind::ActionStarted {
                    action_id: action.id.clone(),
                    attempt: 1,
                })
                .await;

            let started_at = Utc::now();
            let result = run_attempts(
                invoker.as_ref(),
                store.as_ref(),
                &action,
                resolution.value,
                &cancel,
                Duration::from_millis(timeout_ms),
                &retry,
            )
            .await
            .with_span(started_at, Utc::now());

            // The terminal event goes out while the permit is still held,
            // so observers never see more than max_parallel actions
            // started-but-unfinished. The loop side binds the store before
            // releasing dependents.
            emit_terminal_event(&emitter, &result).await;
            if tracked && done_tx.send(result).await.is_err() {
                debug!(action_id = %action.id, "scheduler gone before completion");
            }
        });
    }

    /// READY-but-never-launched actions become `cancelled` on the spot.
    async fn cancel_waiting(
        &self,
        graph: &ActionGraph,
        state: &mut HashMap<String, NodeState>,
        report: &mut SchedulerReport,
        tracked_outstanding: &mut usize,
    ) {
        let mut waiting: Vec<String> = state
            .iter()
            .filter(|(_, s)| **s == NodeState::Waiting)
            .map(|(id, _)| id.clone())
            .collect();
        waiting.sort_by_key(|id| graph.ordinal(id));

        for id in waiting {
            state.insert(id.clone(), NodeState::Done);
            let result = ActionResult::cancelled(&id);
            self.emit_terminal(&result).await;
            let is_tracked = graph
                .get(&id)
                .map(|a| !a.mode.is_fire_and_forget())
                .unwrap_or(false);
            if is_tracked {
                *tracked_outstanding = tracked_outstanding.saturating_sub(1);
                report.record(result);
            }
        }
    }

    /// Launched actions that never reported back within the grace period.
    async fn synthesize_cancelled(
        &self,
        graph: &ActionGraph,
        state: &mut HashMap<String, NodeState>,
        report: &mut SchedulerReport,
        tracked_outstanding: &mut usize,
    ) {
        let mut unreported: Vec<String> = state
            .iter()
            .filter(|(id, s)| {
                **s == NodeState::Launched
                    && graph
                        .get(id)
                        .map(|a| !a.mode.is_fire_and_forget())
                        .unwrap_or(false)
                    && !report.results.contains_key(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        unreported.sort_by_key(|id| graph.ordinal(id));

        for id in unreported {
            warn!(action_id = %id, "action did not observe cancellation in time");
            state.insert(id.clone(), NodeState::Done);
            let result = ActionResult::cancelled(&id);
            self.emit_terminal(&result).await;
            *tracked_outstanding = tracked_outstanding.saturating_sub(1);
            report.record(result);
        }
    }

    async fn emit_terminal(&self, result: &ActionResult) {
        emit_terminal_event(&self.emitter, result).await;
    }
}

/// `action_failed` for error/timeout, `action_completed` otherwise.
async fn emit_terminal_event(emitter: &EventEmitter, result: &ActionResult) {
    let kind = match result.status {
        ActionStatus::Error | ActionStatus::Timeout => EventKind::ActionFailed {
            action_id: result.action_id.clone(),
            error: result
                .error
                .clone()
                .unwrap_or_else(|| ActionFailure::new("unknown", "no failure detail")),
            attempts: result.attempts,
        },
        _ => EventKind::ActionCompleted {
            action_id: result.action_id.clone(),
            status: result.status,
            attempts: result.attempts,
            output: result.output.clone(),
        },
    };
    emitter.emit(kind).await;
}

enum Attempt {
    Finished(InvokeOutcome),
    TimedOut,
    Cancelled,
}

/// Retry loop for one action; the semaphore permit is held for its whole
/// duration.
async fn run_attempts(
    invoker: &dyn ActionInvoker,
    store: &ResultStore,
    action: &Action,
    parameters: Value,
    cancel: &CancelHandle,
    timeout: Duration,
    retry: &RetryPolicy,
) -> ActionResult {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let outcome = if action.kind == ActionKind::Internal {
            Attempt::Finished(internal::dispatch(&action.target, &parameters, store))
        } else {
            let invocation = Invocation {
                action_id: action.id.clone(),
                kind: action.kind,
                target: action.target.clone(),
                parameters: parameters.clone(),
                timeout_ms: timeout.as_millis() as u64,
            };
            tokio::select! {
                _ = cancel.cancelled() => Attempt::Cancelled,
                invoked = tokio::time::timeout(timeout, invoker.invoke(invocation, cancel.clone())) => {
                    match invoked {
                        Ok(outcome) => Attempt::Finished(outcome),
                        Err(_) => Attempt::TimedOut,
                    }
                }
            }
        };

        match outcome {
            Attempt::Cancelled => {
                return ActionResult::failure(
                    &action.id,
                    ActionStatus::Cancelled,
                    ActionFailure::new("cancelled", "execution cancelled"),
                    attempt,
                );
            }
            Attempt::TimedOut => {
                warn!(
                    action_id = %action.id,
                    attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    "action attempt timed out"
                );
                if retry.should_retry(attempt) {
                    if sleep_backoff(retry, attempt, cancel).await.is_err() {
                        return ActionResult::failure(
                            &action.id,
                            ActionStatus::Cancelled,
                            ActionFailure::new("cancelled", "execution cancelled"),
                            attempt,
                        );
                    }
                    continue;
                }
                return ActionResult::failure(
                    &action.id,
                    ActionStatus::Timeout,
                    ActionFailure::new(
                        "timeout",
                        format!("exceeded {}ms on attempt {}", timeout.as_millis(), attempt),
                    ),
                    attempt,
                );
            }
            Attempt::Finished(outcome) if outcome.success => {
                if attempt > 1 {
                    debug!(action_id = %action.id, attempt, "action succeeded after retry");
                }
                return ActionResult::success(
                    &action.id,
                    outcome.output.unwrap_or(Value::Null),
                    attempt,
                );
            }
            Attempt::Finished(outcome) => {
                let failure = outcome.error.unwrap_or_else(|| {
                    ActionFailure::new("unknown", "callable reported failure without detail")
                });
                if outcome.retryable && retry.should_retry(attempt) {
                    warn!(
                        action_id = %action.id,
                        attempt,
                        error = %failure.message,
                        "transient failure, retrying"
                    );
                    if sleep_backoff(retry, attempt, cancel).await.is_err() {
                        return ActionResult::failure(
                            &action.id,
                            ActionStatus::Cancelled,
                            ActionFailure::new("cancelled", "execution cancelled"),
                            attempt,
                        );
                    }
                    continue;
                }
                return ActionResult::failure(&action.id, ActionStatus::Error, failure, attempt);
            }
        }
    }
}

/// Backoff sleep that aborts on cancellation.
async fn sleep_backoff(retry: &RetryPolicy, attempt: u32, cancel: &CancelHandle) -> std::result::Result<(), ()> {
    let delay = retry.delay_after(attempt);
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

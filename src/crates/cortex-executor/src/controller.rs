//! Iteration controller
//!
//! Drives one agent execution: per iteration it opens the LLM token stream,
//! feeds chunks to the protocol parser, forwards parser events outward,
//! builds and validates the action graph when the stream ends, hands the
//! graph to the scheduler, and then decides whether to iterate again.
//!
//! Termination: a final response ends the execution successfully; the loop
//! also stops on the iteration cap, the wall-clock budget, external
//! cancellation, the goal-achieved variable, and no-progress detection (two
//! successive iterations with zero actions and no final response). The
//! iteration counter only advances after every action of the iteration has
//! reached a terminal state, so the iteration stamped on any event is the
//! causally relevant one.

use crate::cancel::CancelHandle;
use crate::emitter::EventEmitter;
use crate::invoker::{ActionInvoker, LlmRequest, TokenStreamProvider};
use crate::scheduler::{DagScheduler, MissingRefWarnings, SchedulerReport};
use cortex_core::action::{Action, ActionResult};
use cortex_core::config::ExecutionConfig;
use cortex_core::error::{CoreError, Result, ValidationError};
use cortex_core::event::{EventKind, ExecutionEvent, ExecutionSummary};
use cortex_core::graph::ActionGraph;
use cortex_core::parser::{ParseOutput, ParserEvent, StreamParser};
use cortex_core::resolver;
use cortex_core::store::{ContextFeedSource, ResultStore};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Entry point for running agent executions
pub struct AgentExecutor {
    invoker: Arc<dyn ActionInvoker>,
    provider: Arc<dyn TokenStreamProvider>,
    feed_source: Option<Arc<dyn ContextFeedSource>>,
    config: ExecutionConfig,
}

/// A running execution: the event stream, the cancellation handle, and the
/// join handle for the final summary
pub struct ExecutionHandle {
    pub execution_id: String,
    pub events: mpsc::Receiver<ExecutionEvent>,
    pub cancel: CancelHandle,
    task: JoinHandle<Result<ExecutionSummary>>,
}

impl ExecutionHandle {
    /// Wait for the execution to finish.
    pub async fn join(self) -> Result<ExecutionSummary> {
        self.task
            .await
            .map_err(|e| CoreError::Internal(format!("controller task panicked: {}", e)))?
    }
}

impl AgentExecutor {
    pub fn new(invoker: Arc<dyn ActionInvoker>, provider: Arc<dyn TokenStreamProvider>) -> Self {
        Self {
            invoker,
            provider,
            feed_source: None,
            config: ExecutionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_feed_source(mut self, source: Arc<dyn ContextFeedSource>) -> Self {
        self.feed_source = Some(source);
        self
    }

    /// Start an execution. Events stream to the returned receiver; the
    /// summary comes from [`ExecutionHandle::join`].
    pub fn start(&self, prompt: impl Into<String>) -> ExecutionHandle {
        let execution_id = Uuid::new_v4().to_string();
        let (emitter, events) = EventEmitter::channel(&execution_id, self.config.event_buffer_capacity);
        let cancel = CancelHandle::new();

        let store = match &self.feed_source {
            Some(source) => ResultStore::with_source(Arc::clone(source)),
            None => ResultStore::new(),
        };

        let controller = Controller {
            invoker: Arc::clone(&self.invoker),
            provider: Arc::clone(&self.provider),
            store: Arc::new(store),
            config: self.config.clone(),
            emitter,
            cancel: cancel.clone(),
            execution_id: execution_id.clone(),
            prompt: prompt.into(),
        };

        let task = tokio::spawn(controller.run());
        ExecutionHandle {
            execution_id,
            events,
            cancel,
            task,
        }
    }

    /// Run to completion, discarding the event stream.
    pub async fn run(&self, prompt: impl Into<String>) -> Result<ExecutionSummary> {
        let handle = self.start(prompt);
        drop(handle.events);
        handle
            .task
            .await
            .map_err(|e| CoreError::Internal(format!("controller task panicked: {}", e)))?
    }
}

struct IterationOutcome {
    report: SchedulerReport,
    /// Resolved response text and its finality, when one was parsed
    response: Option<(String, bool)>,
    action_count: usize,
}

struct Controller {
    invoker: Arc<dyn ActionInvoker>,
    provider: Arc<dyn TokenStreamProvider>,
    store: Arc<ResultStore>,
    config: ExecutionConfig,
    emitter: EventEmitter,
    cancel: CancelHandle,
    execution_id: String,
    prompt: String,
}

impl Controller {
    async fn run(self) -> Result<ExecutionSummary> {
        if let Err(e) = self.config.validate() {
            self.emit_failed(&e).await;
            return Err(e);
        }

        match self.drive().await {
            Ok(summary) => {
                self.emitter.clear_iteration();
                info!(
                    execution_id = %self.execution_id,
                    iterations = summary.iterations,
                    success = summary.success,
                    "execution completed"
                );
                self.emitter
                    .emit(EventKind::ExecutionCompleted {
                        summary: summary.clone(),
                    })
                    .await;
                Ok(summary)
            }
            Err(e) => {
                self.emit_failed(&e).await;
                Err(e)
            }
        }
    }

    async fn emit_failed(&self, error: &CoreError) {
        self.emitter.clear_iteration();
        let (error_subkind, participating_ids) = match error {
            CoreError::Validation(v) => {
                let ids = match v {
                    ValidationError::Cycle { participating } => participating.clone(),
                    _ => Vec::new(),
                };
                (Some(v.subkind().to_string()), ids)
            }
            _ => (None, Vec::new()),
        };
        self.emitter
            .emit(EventKind::ExecutionFailed {
                error_kind: error.kind().to_string(),
                error_subkind,
                message: error.to_string(),
                participating_ids,
                first_failed_action: None,
            })
            .await;
    }

    async fn drive(&self) -> Result<ExecutionSummary> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.max_execution_time_ms);

        self.emitter.clear_iteration();
        self.emitter.emit(EventKind::ExecutionStarted).await;

        let mut summary = ExecutionSummary::default();
        let mut prior_results: Vec<ActionResult> = Vec::new();
        let mut idle_iterations = 0u32;

        for iteration in 1..=self.config.max_iterations {
            let Some(remaining) = budget.checked_sub(started.elapsed()).filter(|d| !d.is_zero())
            else {
                self.timeout_break(&mut summary, "execution_timeout").await;
                break;
            };
            let deadline = match self.config.iteration_timeout_ms {
                Some(ms) => remaining.min(Duration::from_millis(ms)),
                None => remaining,
            };

            self.emitter.set_iteration(iteration);
            self.emitter.emit(EventKind::IterationStarted).await;
            summary.iterations = iteration;

            let outcome =
                match tokio::time::timeout(deadline, self.run_iteration(iteration, &prior_results))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        let code = if deadline == remaining {
                            "execution_timeout"
                        } else {
                            "iteration_timeout"
                        };
                        self.timeout_break(&mut summary, code).await;
                        break;
                    }
                };

            summary.succeeded += outcome.report.succeeded;
            summary.failed += outcome.report.failed;
            summary.skipped += outcome.report.skipped;
            summary.cancelled += outcome.report.cancelled;
            if summary.first_failed_action.is_none() {
                summary.first_failed_action = outcome.report.first_failed.clone();
            }

            let mut results = outcome.report.into_results();
            results.sort_by(|a, b| a.action_id.cmp(&b.action_id));
            prior_results = results;

            self.emitter
                .emit(EventKind::IterationCompleted {
                    actions: outcome.action_count,
                })
                .await;

            if self.cancel.is_cancelled() {
                debug!(execution_id = %self.execution_id, "execution cancelled");
                break;
            }

            if let Some((text, is_final)) = &outcome.response {
                if *is_final {
                    summary.final_response = Some(text.clone());
                    summary.success = true;
                    break;
                }
            }

            if self.config.terminate_on_goal_achieved
                && self.store.get_variable("goal_achieved") == Some(Value::Bool(true))
            {
                debug!(execution_id = %self.execution_id, "goal achieved");
                summary.success = true;
                break;
            }

            if outcome.action_count == 0 {
                idle_iterations += 1;
            } else {
                idle_iterations = 0;
            }
            if self.config.terminate_on_no_progress && idle_iterations >= 2 {
                self.emitter
                    .emit(EventKind::warning(
                        "no_progress",
                        "two successive iterations produced no actions and no final response",
                    ))
                    .await;
                break;
            }

            if iteration == self.config.max_iterations {
                self.emitter
                    .emit(EventKind::warning(
                        "max_iterations_reached",
                        format!("stopping after {} iterations", iteration),
                    ))
                    .await;
            }
        }

        Ok(summary)
    }

    async fn timeout_break(&self, summary: &mut ExecutionSummary, code: &str) {
        warn!(execution_id = %self.execution_id, code, "time budget exhausted");
        self.emitter
            .emit(EventKind::warning(code, "time budget exhausted; cancelling"))
            .await;
        self.cancel.cancel();
        summary.success = false;
    }

    async fn run_iteration(
        &self,
        iteration: u32,
        prior_results: &[ActionResult],
    ) -> Result<IterationOutcome> {
        let mut parser = StreamParser::new(self.config.stream_chunk_flush_chars);
        let warned = Arc::new(MissingRefWarnings::new());

        let request = LlmRequest {
            execution_id: self.execution_id.clone(),
            iteration,
            prompt: self.prompt.clone(),
            prior_results: prior_results.to_vec(),
        };
        let mut stream = self.provider.start_stream(request).await?;

        let mut actions: Vec<Action> = Vec::new();
        let mut response: Option<(String, bool)> = None;

        while let Some(chunk) = stream.next().await {
            let output = parser.feed_bytes(&chunk);
            self.apply_parse_output(output, &mut actions, &mut response)
                .await;
            if self.cancel.is_cancelled() {
                break;
            }
        }
        let output = parser.finish();
        self.apply_parse_output(output, &mut actions, &mut response)
            .await;

        let action_count = actions.len();
        debug!(
            execution_id = %self.execution_id,
            iteration,
            actions = action_count,
            "stream ended, building graph"
        );

        let graph = ActionGraph::build(actions)?;
        let scheduler = DagScheduler::new(
            Arc::clone(&self.invoker),
            Arc::clone(&self.store),
            self.emitter.clone(),
            self.cancel.clone(),
            self.config.clone(),
        );
        let report = scheduler.run(&graph, Arc::clone(&warned)).await?;

        // End-of-response substitution happens after execution so the text
        // sees every binding this iteration produced.
        let resolved = match response {
            Some((raw, is_final)) => {
                let refs = resolver::collect_text_refs(&raw);
                let bindings = self.store.bindings_for(&refs).await;
                let (text, missing) = resolver::resolve_text(&raw, &bindings);
                for name in missing {
                    if warned.first_time(&name) {
                        self.emitter
                            .emit(EventKind::warning(
                                "missing_reference",
                                format!("no binding for '${}'; left literal", name),
                            ))
                            .await;
                    }
                }
                self.emitter
                    .emit(EventKind::ResponseEnd {
                        text: text.clone(),
                        is_final,
                    })
                    .await;
                Some((text, is_final))
            }
            None => None,
        };

        Ok(IterationOutcome {
            report,
            response: resolved,
            action_count,
        })
    }

    /// Forward parser events outward and collect actions and the response.
    async fn apply_parse_output(
        &self,
        output: ParseOutput,
        actions: &mut Vec<Action>,
        response: &mut Option<(String, bool)>,
    ) {
        for event in output.events {
            match event {
                ParserEvent::ThoughtStart => self.emitter.emit(EventKind::ThoughtStart).await,
                ParserEvent::ThoughtChunk { text } => {
                    self.emitter.emit(EventKind::ThoughtChunk { text }).await
                }
                ParserEvent::ThoughtEnd => self.emitter.emit(EventKind::ThoughtEnd).await,
                ParserEvent::ResponseStart { is_final } => {
                    self.emitter
                        .emit(EventKind::ResponseStart { is_final })
                        .await
                }
                ParserEvent::ResponseChunk { text } => {
                    self.emitter.emit(EventKind::ResponseChunk { text }).await
                }
                ParserEvent::ResponseEnd { raw_text, is_final } => {
                    // Held for post-execution substitution; the outward
                    // response_end is emitted with the resolved text.
                    *response = Some((raw_text, is_final));
                }
                ParserEvent::ActionParsed {
                    action_id,
                    kind,
                    mode,
                    target,
                } => {
                    self.emitter
                        .emit(EventKind::ActionParsed {
                            action_id,
                            action_kind: kind,
                            mode,
                            target,
                        })
                        .await
                }
                ParserEvent::ContextFeed { id, value } => {
                    debug!(feed = %id, "stream context feed binding");
                    self.store.update_feed(&id, value);
                }
                ParserEvent::Warning { code, message } => {
                    self.emitter.emit(EventKind::warning(code, message)).await
                }
                ParserEvent::ProtocolError { message } => {
                    self.emitter.emit(EventKind::Error { message }).await
                }
            }
        }
        actions.extend(output.actions);
    }
}

//! End-to-end scenarios for the agent execution core
//!
//! Each test wires the controller to a scripted token stream and a mock
//! invoker, then checks the emitted event stream and the final summary.
//! Timing-sensitive scenarios run under paused tokio time so backoff and
//! parallelism are measured exactly.

use async_trait::async_trait;
use cortex_core::error::{CoreError, Result, ValidationError};
use cortex_core::event::{EventKind, ExecutionEvent, ExecutionSummary};
use cortex_core::ActionStatus;
use cortex_executor::{
    ActionInvoker, AgentExecutor, CancelHandle, ExecutionConfig, InvokeOutcome, Invocation,
    LlmRequest, TokenStream, TokenStreamProvider,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test doubles
// ============================================================================

/// Streams one scripted response per iteration, split into small chunks to
/// exercise chunk-boundary handling.
struct ScriptedProvider {
    scripts: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    fn new(scripts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.iter().map(|s| s.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TokenStreamProvider for ScriptedProvider {
    async fn start_stream(&self, request: LlmRequest) -> Result<TokenStream> {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let chunks: Vec<Vec<u8>> = script
            .into_bytes()
            .chunks(7)
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Per-target scripted callable: fixed outputs, permanent and transient
/// failures, and a uniform dispatch delay.
struct MockInvoker {
    delay: Duration,
    outputs: HashMap<String, Value>,
    fail: HashSet<String>,
    transient: Mutex<HashMap<String, u32>>,
}

impl MockInvoker {
    fn instant() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            outputs: HashMap::new(),
            fail: HashSet::new(),
            transient: Mutex::new(HashMap::new()),
        }
    }

    fn output(mut self, target: &str, value: Value) -> Self {
        self.outputs.insert(target.to_string(), value);
        self
    }

    fn failing(mut self, target: &str) -> Self {
        self.fail.insert(target.to_string());
        self
    }

    fn transient(self, target: &str, failures: u32) -> Self {
        self.transient.lock().insert(target.to_string(), failures);
        self
    }
}

#[async_trait]
impl ActionInvoker for MockInvoker {
    async fn invoke(&self, invocation: Invocation, _cancel: CancelHandle) -> InvokeOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.contains(&invocation.target) {
            return InvokeOutcome::error("boom", "scripted permanent failure");
        }
        {
            let mut transient = self.transient.lock();
            if let Some(left) = transient.get_mut(&invocation.target) {
                if *left > 0 {
                    *left -= 1;
                    return InvokeOutcome::transient("flaky", "scripted transient failure");
                }
            }
        }
        match self.outputs.get(&invocation.target) {
            Some(value) => InvokeOutcome::ok(value.clone()),
            None => InvokeOutcome::ok(json!({ "echo": invocation.parameters })),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Run an execution, collecting every event up to the terminal one.
async fn run_collect(
    executor: &AgentExecutor,
    prompt: &str,
) -> (Vec<ExecutionEvent>, Result<ExecutionSummary>) {
    let mut handle = executor.start(prompt);
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        let terminal = matches!(
            event.kind,
            EventKind::ExecutionCompleted { .. } | EventKind::ExecutionFailed { .. }
        );
        events.push(event);
        if terminal {
            break;
        }
    }
    let summary = handle.join().await;
    (events, summary)
}

fn seq_of(events: &[ExecutionEvent], name: &str, action_id: Option<&str>) -> Option<u64> {
    events
        .iter()
        .find(|e| e.kind.name() == name && e.kind.action_id() == action_id)
        .map(|e| e.seq)
}

fn count_kind(events: &[ExecutionEvent], name: &str) -> usize {
    events.iter().filter(|e| e.kind.name() == name).count()
}

fn assert_seq_strictly_monotonic(events: &[ExecutionEvent]) {
    assert_eq!(events.first().map(|e| e.seq), Some(0), "seq starts at 0");
    for pair in events.windows(2) {
        assert!(
            pair[1].seq > pair[0].seq,
            "seq not strictly increasing: {} then {}",
            pair[0].seq,
            pair[1].seq
        );
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// S1: parallel fetch + dependent merge with `$name` resolution in the
/// final response.
#[tokio::test(start_paused = true)]
async fn s1_parallel_fetch_then_merge() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" mode="async" id="F1">{"name": "fetch_a", "output_key": "a"}</action>"#,
        r#"<action type="tool" mode="async" id="F2">{"name": "fetch_b", "output_key": "b"}</action>"#,
        r#"<action type="tool" id="M" depends_on="F1,F2">{"name": "merge", "parameters": {"x": "$a", "y": "$b"}}</action>"#,
        r#"<response final="true">sum=$a+$b</response>"#,
    )]);
    let invoker = MockInvoker::with_delay(Duration::from_millis(1000))
        .output("fetch_a", json!(10))
        .output("fetch_b", json!(20))
        .output("merge", json!(30));

    let executor = AgentExecutor::new(Arc::new(invoker), provider.clone());
    let start = tokio::time::Instant::now();
    let (events, summary) = run_collect(&executor, "add the numbers").await;
    let elapsed = start.elapsed();

    let summary = summary.unwrap();
    assert!(summary.success);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.final_response.as_deref(), Some("sum=10+20"));

    // F1 and F2 overlap; M waits for both: two rounds of one time unit.
    assert!(elapsed >= Duration::from_millis(2000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "elapsed {:?}", elapsed);

    let f1_done = seq_of(&events, "action_completed", Some("F1")).unwrap();
    let f2_done = seq_of(&events, "action_completed", Some("F2")).unwrap();
    let m_started = seq_of(&events, "action_started", Some("M")).unwrap();
    assert!(m_started > f1_done.max(f2_done), "M starts after both fetches");

    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::ResponseEnd { text, is_final: true } if text == "sum=10+20"
    )));
    assert_seq_strictly_monotonic(&events);
}

/// S2: a failing chain skips every transitive dependent.
#[tokio::test]
async fn s2_chain_with_failure() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" id="A">{"name": "broken"}</action>"#,
        r#"<action type="tool" id="B" depends_on="A">{"name": "t"}</action>"#,
        r#"<action type="tool" id="C" depends_on="B">{"name": "t"}</action>"#,
    )]);
    let invoker = MockInvoker::instant().failing("broken");

    let executor = AgentExecutor::new(Arc::new(invoker), provider)
        .with_config(ExecutionConfig::default().with_max_iterations(1));
    let (events, summary) = run_collect(&executor, "do the chain").await;

    let summary = summary.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.succeeded, 0);
    assert!(!summary.success);
    assert_eq!(summary.first_failed_action.as_deref(), Some("A"));

    assert!(seq_of(&events, "action_failed", Some("A")).is_some());
    assert!(seq_of(&events, "action_started", Some("B")).is_none());
    assert!(seq_of(&events, "action_started", Some("C")).is_none());
    assert_eq!(count_kind(&events, "execution_completed"), 1);
}

/// S3: transient failures retried with exponential backoff, then success.
#[tokio::test(start_paused = true)]
async fn s3_retry_with_exponential_backoff() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" id="A">{"name": "flaky", "retry": {"max_attempts": 3, "backoff": "exponential", "initial_delay_ms": 100, "max_delay_ms": 1000}}</action>"#,
        r#"<response final="true">recovered</response>"#,
    )]);
    let invoker = MockInvoker::instant().transient("flaky", 2);

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let start = tokio::time::Instant::now();
    let (events, summary) = run_collect(&executor, "poke the flaky tool").await;
    let elapsed = start.elapsed();

    let summary = summary.unwrap();
    assert!(summary.success);
    assert_eq!(summary.succeeded, 1);

    let completed = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::ActionCompleted {
                action_id,
                status,
                attempts,
                ..
            } if action_id == "A" => Some((*status, *attempts)),
            _ => None,
        })
        .unwrap();
    assert_eq!(completed, (ActionStatus::Success, 3));

    // Inter-attempt delays of ~100ms and ~200ms.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(450), "elapsed {:?}", elapsed);
}

/// S4: a non-final response iterates; the next request carries the prior
/// iteration's results.
#[tokio::test]
async fn s4_non_final_response_iterates() {
    let provider = ScriptedProvider::new(&[
        concat!(
            r#"<action type="tool" id="X">{"name": "probe", "output_key": "probe_result"}</action>"#,
            r#"<response final="false">progress...</response>"#,
        ),
        r#"<response final="true">done</response>"#,
    ]);
    let invoker = MockInvoker::instant().output("probe", json!({"status": "ready"}));

    let executor = AgentExecutor::new(Arc::new(invoker), provider.clone());
    let (events, summary) = run_collect(&executor, "probe until ready").await;

    let summary = summary.unwrap();
    assert!(summary.success);
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.final_response.as_deref(), Some("done"));

    assert_eq!(count_kind(&events, "iteration_started"), 2);
    assert_eq!(count_kind(&events, "iteration_completed"), 2);

    // iteration_started(2) strictly after iteration_completed(1)
    let completed_1 = events
        .iter()
        .find(|e| e.kind.name() == "iteration_completed" && e.iteration == Some(1))
        .map(|e| e.seq)
        .unwrap();
    let started_2 = events
        .iter()
        .find(|e| e.kind.name() == "iteration_started" && e.iteration == Some(2))
        .map(|e| e.seq)
        .unwrap();
    assert!(started_2 > completed_1);

    // The second LLM request carried X's result as context.
    let requests = provider.requests.lock();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prior_results.is_empty());
    let carried = &requests[1].prior_results;
    assert_eq!(carried.len(), 1);
    assert_eq!(carried[0].action_id, "X");
    assert_eq!(carried[0].status, ActionStatus::Success);
    assert_eq!(carried[0].output, Some(json!({"status": "ready"})));
}

/// S5: a dependency cycle fails validation before any action starts.
#[tokio::test]
async fn s5_cycle_rejected() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" id="A" depends_on="B">{"name": "t"}</action>"#,
        r#"<action type="tool" id="B" depends_on="A">{"name": "t"}</action>"#,
    )]);
    let invoker = MockInvoker::instant();

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let (events, summary) = run_collect(&executor, "impossible plan").await;

    match summary {
        Err(CoreError::Validation(ValidationError::Cycle { participating })) => {
            assert_eq!(participating, vec!["A".to_string(), "B".to_string()]);
        }
        other => panic!("expected cycle validation error, got {:?}", other),
    }

    let failed = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::ExecutionFailed {
                error_kind,
                error_subkind,
                participating_ids,
                ..
            } => Some((error_kind.clone(), error_subkind.clone(), participating_ids.clone())),
            _ => None,
        })
        .expect("execution_failed emitted");
    assert_eq!(failed.0, "validation");
    assert_eq!(failed.1.as_deref(), Some("cycle"));
    assert_eq!(failed.2, vec!["A".to_string(), "B".to_string()]);

    assert_eq!(count_kind(&events, "action_started"), 0);
}

/// S6: a trailing comma in the action body is repaired silently.
#[tokio::test]
async fn s6_malformed_action_json_repaired() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" id="T">{"name":"t","parameters":{},}</action>"#,
        r#"<response final="true">ok</response>"#,
    )]);
    let invoker = MockInvoker::instant();

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let (events, summary) = run_collect(&executor, "tolerate the comma").await;

    assert!(summary.unwrap().success);
    let completed = events.iter().any(|e| matches!(
        &e.kind,
        EventKind::ActionCompleted { action_id, status: ActionStatus::Success, .. } if action_id == "T"
    ));
    assert!(completed);
    assert_eq!(count_kind(&events, "warning"), 0, "no warnings expected");
}

// ============================================================================
// Boundary behaviors
// ============================================================================

/// A chain of N sync actions runs strictly sequentially.
#[tokio::test(start_paused = true)]
async fn sync_chain_runs_sequentially() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" id="a">{"name": "t"}</action>"#,
        r#"<action type="tool" id="b" depends_on="a">{"name": "t"}</action>"#,
        r#"<action type="tool" id="c" depends_on="b">{"name": "t"}</action>"#,
        r#"<response final="true">done</response>"#,
    )]);
    let invoker = MockInvoker::with_delay(Duration::from_millis(1000));

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let start = tokio::time::Instant::now();
    let (_, summary) = run_collect(&executor, "chain").await;
    let elapsed = start.elapsed();

    assert_eq!(summary.unwrap().succeeded, 3);
    assert!(elapsed >= Duration::from_millis(3000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3500), "elapsed {:?}", elapsed);
}

/// N independent actions under `max_parallel = K` take ~ceil(N/K) rounds.
#[tokio::test(start_paused = true)]
async fn independent_actions_bounded_by_max_parallel() {
    let script: String = (0..4)
        .map(|i| {
            format!(
                r#"<action type="tool" id="a{}">{{"name": "t"}}</action>"#,
                i
            )
        })
        .chain(std::iter::once(
            r#"<response final="true">done</response>"#.to_string(),
        ))
        .collect();
    let provider = ScriptedProvider::new(&[&script]);
    let invoker = MockInvoker::with_delay(Duration::from_millis(1000));

    let executor = AgentExecutor::new(Arc::new(invoker), provider)
        .with_config(ExecutionConfig::default().with_max_parallel(2));
    let start = tokio::time::Instant::now();
    let (_, summary) = run_collect(&executor, "fan out").await;
    let elapsed = start.elapsed();

    assert_eq!(summary.unwrap().succeeded, 4);
    // 4 actions, 2 slots: two rounds.
    assert!(elapsed >= Duration::from_millis(2000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "elapsed {:?}", elapsed);
}

/// Fire-and-forget actions never block the scheduler.
#[tokio::test]
async fn fire_and_forget_does_not_block() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" mode="fire_and_forget" id="bg1">{"name": "slow"}</action>"#,
        r#"<action type="tool" mode="fire_and_forget" id="bg2">{"name": "slow"}</action>"#,
        r#"<response final="true">launched</response>"#,
    )]);
    let invoker = MockInvoker::with_delay(Duration::from_millis(300));

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let start = std::time::Instant::now();
    let (_, summary) = run_collect(&executor, "launch background work").await;

    assert!(summary.unwrap().success);
    assert!(
        start.elapsed() < Duration::from_millis(150),
        "scheduler must not wait on fire-and-forget"
    );
}

/// Two empty iterations trigger no-progress termination.
#[tokio::test]
async fn no_progress_terminates() {
    let provider = ScriptedProvider::new(&["", "", ""]);
    let invoker = MockInvoker::instant();

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let (events, summary) = run_collect(&executor, "say nothing").await;

    let summary = summary.unwrap();
    assert_eq!(summary.iterations, 2);
    assert!(!summary.success);
    assert!(events.iter().any(
        |e| matches!(&e.kind, EventKind::Warning { code, .. } if code == "no_progress")
    ));
    assert_eq!(count_kind(&events, "execution_completed"), 1);
}

/// The goal-achieved variable terminates the loop successfully.
#[tokio::test]
async fn goal_achieved_terminates() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="internal" id="flag">{"name": "set_variable", "parameters": {"name": "goal_achieved", "value": true}}</action>"#,
        r#"<response final="false">still going (or so I claim)</response>"#,
    )]);
    let invoker = MockInvoker::instant();

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let (_, summary) = run_collect(&executor, "achieve the goal").await;

    let summary = summary.unwrap();
    assert!(summary.success);
    assert_eq!(summary.iterations, 1);
}

/// External cancellation ends with a non-success completed summary.
#[tokio::test]
async fn external_cancellation() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" id="slow1">{"name": "slow"}</action>"#,
        r#"<action type="tool" id="slow2" depends_on="slow1">{"name": "slow"}</action>"#,
    )]);
    let invoker = MockInvoker::with_delay(Duration::from_millis(500));

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let mut handle = executor.start("take your time");
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        let terminal = matches!(event.kind, EventKind::ExecutionCompleted { .. });
        events.push(event);
        if terminal {
            break;
        }
    }
    let summary = handle.join().await.unwrap();

    assert!(!summary.success);
    assert!(summary.cancelled >= 1, "summary: {:?}", summary);
    assert!(seq_of(&events, "action_started", Some("slow2")).is_none());
    assert_seq_strictly_monotonic(&events);
}

/// The per-iteration deadline cancels a stuck iteration.
#[tokio::test(start_paused = true)]
async fn iteration_timeout_cancels_execution() {
    let provider = ScriptedProvider::new(&[concat!(
        r#"<action type="tool" id="stuck">{"name": "slow"}</action>"#,
        r#"<response final="true">never reached</response>"#,
    )]);
    let invoker = MockInvoker::with_delay(Duration::from_secs(600));

    let executor = AgentExecutor::new(Arc::new(invoker), provider).with_config(
        ExecutionConfig::default()
            .with_iteration_timeout_ms(500)
            .with_default_action_timeout_ms(60_000),
    );
    let start = tokio::time::Instant::now();
    let (events, summary) = run_collect(&executor, "get stuck").await;

    let summary = summary.unwrap();
    assert!(!summary.success);
    assert!(summary.final_response.is_none());
    assert!(start.elapsed() < Duration::from_secs(2), "deadline enforced");
    assert!(events.iter().any(
        |e| matches!(&e.kind, EventKind::Warning { code, .. } if code == "iteration_timeout")
    ));
    assert_eq!(count_kind(&events, "execution_completed"), 1);
}

/// Thought streaming produces ordered chunks bracketed by start/end.
#[tokio::test]
async fn thought_streaming_event_order() {
    let provider = ScriptedProvider::new(&[concat!(
        "<thought>first consider the shape of the problem\nthen act</thought>",
        r#"<response final="true">acted</response>"#,
    )]);
    let invoker = MockInvoker::instant();

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let (events, summary) = run_collect(&executor, "think first").await;
    assert!(summary.unwrap().success);

    let start = seq_of(&events, "thought_start", None).unwrap();
    let end = seq_of(&events, "thought_end", None).unwrap();
    assert!(start < end);

    let text: String = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ThoughtChunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "first consider the shape of the problem\nthen act");
    assert_seq_strictly_monotonic(&events);
}

/// Missing `$name` references warn once and stay literal in the response.
#[tokio::test]
async fn missing_reference_warns_and_stays_literal() {
    let provider = ScriptedProvider::new(&[
        r#"<response final="true">value is $never_bound and again $never_bound</response>"#,
    ]);
    let invoker = MockInvoker::instant();

    let executor = AgentExecutor::new(Arc::new(invoker), provider);
    let (events, summary) = run_collect(&executor, "reference nothing").await;

    let summary = summary.unwrap();
    assert_eq!(
        summary.final_response.as_deref(),
        Some("value is $never_bound and again $never_bound")
    );
    let warnings: Vec<_> = events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::Warning { code, .. } if code == "missing_reference"))
        .collect();
    assert_eq!(warnings.len(), 1, "one warning per unique name");
}

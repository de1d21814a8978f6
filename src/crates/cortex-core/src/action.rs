//! Action and result types
//!
//! An [`Action`] is the declarative unit of work parsed from an LLM response.
//! Actions carry a kind (what class of callable they target), a dispatch mode,
//! dependency edges, and optional retry/timeout overrides. The scheduler
//! produces exactly one [`ActionResult`] per tracked action; results are
//! written once and never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Class of callable an action targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// External tool (script, subprocess)
    Tool,
    /// Sub-agent invocation
    Agent,
    /// Persistent service call
    Relic,
    /// Composed workflow
    Workflow,
    /// Nested LLM call
    Llm,
    /// Dispatched inside the scheduler, no external call-out
    Internal,
}

impl ActionKind {
    /// Parse the `type` attribute of an `<action>` tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool" => Some(ActionKind::Tool),
            "agent" => Some(ActionKind::Agent),
            "relic" => Some(ActionKind::Relic),
            "workflow" => Some(ActionKind::Workflow),
            "llm" => Some(ActionKind::Llm),
            "internal" => Some(ActionKind::Internal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Tool => "tool",
            ActionKind::Agent => "agent",
            ActionKind::Relic => "relic",
            ActionKind::Workflow => "workflow",
            ActionKind::Llm => "llm",
            ActionKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch mode for an action.
///
/// `Sync` and `Async` are identical from the perspective of dependents: a
/// dependent always waits for the bound result. The distinction is advisory
/// and controls how the action is dispatched. Only `FireAndForget` breaks
/// the dependency-wait contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    #[default]
    Sync,
    Async,
    FireAndForget,
}

impl ActionMode {
    /// Parse the `mode` attribute of an `<action>` tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(ActionMode::Sync),
            "async" => Some(ActionMode::Async),
            "fire_and_forget" => Some(ActionMode::FireAndForget),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionMode::Sync => "sync",
            ActionMode::Async => "async",
            ActionMode::FireAndForget => "fire_and_forget",
        }
    }

    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, ActionMode::FireAndForget)
    }
}

impl std::fmt::Display for ActionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Constant delay
    #[default]
    None,
    /// Constant delay (factor 1)
    Linear,
    /// Doubling delay (factor 2)
    Exponential,
}

impl Backoff {
    /// Multiplier applied per additional attempt.
    pub fn factor(&self) -> u64 {
        match self {
            Backoff::None | Backoff::Linear => 1,
            Backoff::Exponential => 2,
        }
    }
}

/// Per-action retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff strategy between attempts
    #[serde(default)]
    pub backoff: Backoff,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given number of attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the initial delay.
    pub fn with_initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Delay to sleep before retrying after the given failed attempt
    /// (1-indexed): `initial_delay_ms * factor^(attempt-1)`, capped at
    /// `max_delay_ms`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff.factor();
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = self
            .initial_delay_ms
            .saturating_mul(factor.saturating_pow(exp));
        Duration::from_millis(scaled.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempt` attempts have run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A declarative unit of work parsed from an LLM response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Unique id within one LLM response; auto-assigned when absent
    pub id: String,

    /// Class of callable the action targets
    pub kind: ActionKind,

    /// Dispatch mode
    #[serde(default)]
    pub mode: ActionMode,

    /// Name of the callable
    pub target: String,

    /// Arbitrary JSON handed to the callable after `$name` resolution
    #[serde(default)]
    pub parameters: Value,

    /// Ids of actions that must reach a terminal state first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// When present, the result is bound under this name in the result store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,

    /// Per-action timeout override, milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Per-action retry override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// When true, dependents run with this action's result bound to null
    /// instead of being skipped on failure
    #[serde(default)]
    pub skip_on_error: bool,

    /// Unrecognized `<action>` attributes, preserved verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Action {
    /// Create a new action.
    pub fn new(id: impl Into<String>, kind: ActionKind, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            mode: ActionMode::default(),
            target: target.into(),
            parameters: Value::Null,
            depends_on: Vec::new(),
            output_key: None,
            timeout_ms: None,
            retry: None,
            skip_on_error: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the dispatch mode.
    pub fn with_mode(mut self, mode: ActionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the parameters.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Add dependency edges.
    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Bind the result under a name in the result store.
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Override the action timeout.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Continue dependents with a null binding when this action fails.
    pub fn with_skip_on_error(mut self, skip: bool) -> Self {
        self.skip_on_error = skip;
        self
    }
}

/// Terminal state of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Error,
    Skipped,
    Timeout,
    Cancelled,
}

impl ActionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionStatus::Success)
    }

    /// Whether dependents must be skipped (absent `skip_on_error`).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ActionStatus::Error | ActionStatus::Timeout | ActionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Error => "error",
            ActionStatus::Skipped => "skipped",
            ActionStatus::Timeout => "timeout",
            ActionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure detail attached to non-success results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    /// Failure class as reported by the callable (or `timeout`, `cancelled`)
    pub kind: String,
    pub message: String,
}

impl ActionFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// The immutable outcome of one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub status: ActionStatus,

    /// Output bound into the result store; `None` for non-success states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Present exactly when `status` is not `success`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionFailure>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Number of invocation attempts that ran
    pub attempts: u32,
}

impl ActionResult {
    /// Successful result carrying an output.
    pub fn success(action_id: impl Into<String>, output: Value, attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Success,
            output: Some(output),
            error: None,
            started_at: now,
            finished_at: now,
            attempts,
        }
    }

    /// Non-success result carrying a failure.
    pub fn failure(
        action_id: impl Into<String>,
        status: ActionStatus,
        failure: ActionFailure,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            action_id: action_id.into(),
            status,
            output: None,
            error: Some(failure),
            started_at: now,
            finished_at: now,
            attempts,
        }
    }

    /// Result for an action that never ran.
    pub fn skipped(action_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::failure(
            action_id,
            ActionStatus::Skipped,
            ActionFailure::new("skipped", cause),
            0,
        )
    }

    /// Result for an action cancelled before or during execution.
    pub fn cancelled(action_id: impl Into<String>) -> Self {
        Self::failure(
            action_id,
            ActionStatus::Cancelled,
            ActionFailure::new("cancelled", "execution cancelled"),
            0,
        )
    }

    /// Set the observed start/finish instants.
    pub fn with_span(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.finished_at = finished_at;
        self
    }
}

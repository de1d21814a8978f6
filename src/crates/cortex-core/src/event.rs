//! Execution event stream types
//!
//! A single execution produces a linear stream of [`ExecutionEvent`]s
//! describing parser state transitions, action lifecycles, and iteration
//! control. Every event carries a strictly monotonic sequence number, a
//! wall-clock timestamp, and correlation ids. Events serialize to a JSON
//! envelope with `kind` as the discriminant, so the stream is directly
//! consumable as NDJSON by outer transports.

use crate::action::{ActionFailure, ActionKind, ActionMode, ActionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope common to every emitted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Strictly monotonic, starting at 0
    pub seq: u64,

    /// Wall-clock emission time (RFC 3339 on the wire)
    pub ts: DateTime<Utc>,

    pub execution_id: String,

    /// Iteration the event belongs to; absent for execution-scoped events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,

    #[serde(flatten)]
    pub kind: EventKind,
}

/// Final outcome of an execution, carried by `execution_completed`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Iterations that ran to a terminal state
    pub iterations: u32,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,

    /// True when the execution ended with a final response and no failures
    pub success: bool,

    /// Id of the first action to fail, when any did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failed_action: Option<String>,

    /// Resolved text of the final response, when one was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
}

/// Tagged union of event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,

    IterationStarted,

    ThoughtStart,
    ThoughtChunk {
        text: String,
    },
    ThoughtEnd,

    ActionParsed {
        action_id: String,
        action_kind: ActionKind,
        mode: ActionMode,
        target: String,
    },
    ActionStarted {
        action_id: String,
        attempt: u32,
    },
    ActionCompleted {
        action_id: String,
        status: ActionStatus,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    ActionFailed {
        action_id: String,
        error: ActionFailure,
        attempts: u32,
    },

    ResponseStart {
        is_final: bool,
    },
    ResponseChunk {
        text: String,
    },
    ResponseEnd {
        text: String,
        is_final: bool,
    },

    IterationCompleted {
        actions: usize,
    },

    ExecutionCompleted {
        summary: ExecutionSummary,
    },
    ExecutionFailed {
        /// Root-cause class (`validation`, `internal`, `llm`, ...)
        error_kind: String,
        /// Finer discriminant, e.g. a validation subkind like `cycle`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_subkind: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        participating_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_failed_action: Option<String>,
    },

    Warning {
        /// Stable warning code (`missing_reference`, `malformed_action_json`,
        /// `unknown_tag`, `duplicate_response`, ...)
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl EventKind {
    /// Chunk events may be coalesced under backpressure; everything else is
    /// a lifecycle event and is never dropped.
    pub fn is_chunk(&self) -> bool {
        matches!(
            self,
            EventKind::ThoughtChunk { .. } | EventKind::ResponseChunk { .. }
        )
    }

    /// The action this event concerns, when any.
    pub fn action_id(&self) -> Option<&str> {
        match self {
            EventKind::ActionParsed { action_id, .. }
            | EventKind::ActionStarted { action_id, .. }
            | EventKind::ActionCompleted { action_id, .. }
            | EventKind::ActionFailed { action_id, .. } => Some(action_id),
            EventKind::Warning { action_id, .. } => action_id.as_deref(),
            _ => None,
        }
    }

    /// Wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted => "execution_started",
            EventKind::IterationStarted => "iteration_started",
            EventKind::ThoughtStart => "thought_start",
            EventKind::ThoughtChunk { .. } => "thought_chunk",
            EventKind::ThoughtEnd => "thought_end",
            EventKind::ActionParsed { .. } => "action_parsed",
            EventKind::ActionStarted { .. } => "action_started",
            EventKind::ActionCompleted { .. } => "action_completed",
            EventKind::ActionFailed { .. } => "action_failed",
            EventKind::ResponseStart { .. } => "response_start",
            EventKind::ResponseChunk { .. } => "response_chunk",
            EventKind::ResponseEnd { .. } => "response_end",
            EventKind::IterationCompleted { .. } => "iteration_completed",
            EventKind::ExecutionCompleted { .. } => "execution_completed",
            EventKind::ExecutionFailed { .. } => "execution_failed",
            EventKind::Warning { .. } => "warning",
            EventKind::Error { .. } => "error",
        }
    }

    /// Warning helper with a stable code.
    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        EventKind::Warning {
            code: code.into(),
            message: message.into(),
            action_id: None,
        }
    }

    /// Warning helper scoped to an action.
    pub fn action_warning(
        code: impl Into<String>,
        message: impl Into<String>,
        action_id: impl Into<String>,
    ) -> Self {
        EventKind::Warning {
            code: code.into(),
            message: message.into(),
            action_id: Some(action_id.into()),
        }
    }
}

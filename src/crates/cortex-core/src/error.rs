//! Error types for the agent execution core
//!
//! This module defines all error types that can occur while parsing an LLM
//! response stream, validating an action graph, and executing actions. All
//! errors implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! CoreError
//! ├── Parse          - Malformed protocol stream (one construct dropped)
//! ├── Validation     - Action graph defects (fatal for the iteration)
//! ├── Action         - Terminal failure of a single action after retries
//! ├── Timeout        - An action or scope exceeded its deadline
//! ├── Cancelled      - Execution-wide cancellation
//! ├── Llm            - The token stream provider failed
//! ├── Serialization  - JSON encode/decode errors
//! ├── Config         - Unusable execution configuration
//! └── Internal       - Invariant violation in core code (fatal)
//! ```
//!
//! Only `Validation`, `Cancelled` and `Internal` terminate an iteration
//! early; everything else is surfaced through events and the execution
//! continues where possible.

use thiserror::Error;

/// Errors that can occur during an agent execution
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed protocol stream
    #[error("parse error: {0}")]
    Parse(String),

    /// Action graph failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An action terminated in failure after exhausting its retries
    #[error("action '{action_id}' failed: {message}")]
    Action { action_id: String, message: String },

    /// A scope exceeded its deadline
    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The execution was cancelled
    #[error("execution cancelled")]
    Cancelled,

    /// The token stream provider failed
    #[error("llm stream error: {0}")]
    Llm(String),

    /// JSON encode/decode error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The execution configuration cannot be honored
    #[error("configuration error: {0}")]
    Config(String),

    /// Invariant violation in core code
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable kind discriminant used in `execution_failed` events.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Parse(_) => "parse",
            CoreError::Validation(_) => "validation",
            CoreError::Action { .. } => "action",
            CoreError::Timeout { .. } => "timeout",
            CoreError::Cancelled => "cancelled",
            CoreError::Llm(_) => "llm",
            CoreError::Serialization(_) => "serialization",
            CoreError::Config(_) => "config",
            CoreError::Internal(_) => "internal",
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Defects detected while building an action graph.
///
/// A validation error is fatal for the iteration that produced the actions:
/// no action from the offending graph is ever launched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Two actions in the same iteration share an id
    #[error("duplicate action id '{0}'")]
    DuplicateId(String),

    /// An action depends on an id that is not in the graph
    #[error("action '{action_id}' depends on unknown action '{missing}'")]
    DanglingDependency { action_id: String, missing: String },

    /// The dependency graph contains a cycle
    #[error("dependency cycle involving actions [{}]", participating.join(", "))]
    Cycle { participating: Vec<String> },

    /// An action depends on a fire-and-forget action, whose result is
    /// never observable
    #[error("action '{action_id}' depends on fire-and-forget action '{dependency}'")]
    DependsOnFireAndForget {
        action_id: String,
        dependency: String,
    },

    /// Two actions bind results under the same output key
    #[error("duplicate output key '{0}'")]
    DuplicateOutputKey(String),

    /// The iteration declared more actions than the scheduler will queue
    #[error("graph has {size} actions, limit is {limit}")]
    GraphTooLarge { size: usize, limit: usize },
}

impl ValidationError {
    /// Stable subkind discriminant used in `execution_failed` events.
    pub fn subkind(&self) -> &'static str {
        match self {
            ValidationError::DuplicateId(_) => "duplicate_id",
            ValidationError::DanglingDependency { .. } => "dangling_dependency",
            ValidationError::Cycle { .. } => "cycle",
            ValidationError::DependsOnFireAndForget { .. } => "depends_on_fire_and_forget",
            ValidationError::DuplicateOutputKey(_) => "duplicate_output_key",
            ValidationError::GraphTooLarge { .. } => "graph_too_large",
        }
    }
}

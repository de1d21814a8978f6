//! Collaborator contracts
//!
//! The executor consumes three seams, all provider-agnostic: a callable
//! interface covering tools, agents, relics, workflows and nested llm calls
//! ([`ActionInvoker`]); a token stream for the per-iteration LLM response
//! ([`TokenStreamProvider`]); and the context-feed source re-exported from
//! `cortex_core::store`. Implementations must be `Send + Sync` and observe
//! the cancellation handle at I/O boundaries.
//!
//! Retryable-error classification lives with the callable implementation:
//! the scheduler trusts [`InvokeOutcome::retryable`] verbatim.

use crate::cancel::CancelHandle;
use async_trait::async_trait;
use cortex_core::action::{ActionFailure, ActionKind, ActionResult};
use cortex_core::error::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One dispatch of an action to a collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub action_id: String,
    pub kind: ActionKind,
    /// Name of the callable
    pub target: String,
    /// Parameters after `$name` resolution
    pub parameters: Value,
    /// Effective timeout the scheduler will enforce; advisory to the
    /// callable so it can bound its own I/O
    pub timeout_ms: u64,
}

/// Result of one invocation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeOutcome {
    pub output: Option<Value>,
    pub success: bool,
    /// Whether a failed attempt may be retried
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionFailure>,
}

impl InvokeOutcome {
    /// Successful invocation with an output value.
    pub fn ok(output: Value) -> Self {
        Self {
            output: Some(output),
            success: true,
            retryable: false,
            error: None,
        }
    }

    /// Permanent failure; the scheduler will not retry.
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            output: None,
            success: false,
            retryable: false,
            error: Some(ActionFailure::new(kind, message)),
        }
    }

    /// Transient failure; the scheduler may retry within the action's
    /// policy.
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            output: None,
            success: false,
            retryable: true,
            error: Some(ActionFailure::new(kind, message)),
        }
    }
}

/// Callable interface from collaborators to the core.
///
/// One contract covers every action kind except `internal` (dispatched
/// inside the scheduler); the core does not care how each kind is
/// implemented.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    /// Execute one attempt. Blocking from the worker's perspective; must
    /// observe `cancel` at I/O boundaries.
    async fn invoke(&self, invocation: Invocation, cancel: CancelHandle) -> InvokeOutcome;
}

/// Raw byte chunks of one LLM response. Chunks arrive in order and may cut
/// UTF-8 codepoints; stream close signals end-of-iteration.
pub type TokenStream = BoxStream<'static, Vec<u8>>;

/// Request for one iteration's LLM call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub execution_id: String,
    pub iteration: u32,
    /// The user's task, unchanged across iterations
    pub prompt: String,
    /// Terminal results of the previous iteration's actions; empty on the
    /// first iteration
    pub prior_results: Vec<ActionResult>,
}

/// LLM transport seam consumed by the iteration controller
#[async_trait]
pub trait TokenStreamProvider: Send + Sync {
    /// Open the response stream for one iteration. Transport errors after
    /// the stream opened are signalled by closing it early.
    async fn start_stream(&self, request: LlmRequest) -> Result<TokenStream>;
}

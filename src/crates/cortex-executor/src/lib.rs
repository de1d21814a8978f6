//! # cortex-executor - DAG Scheduler and Iteration Controller
//!
//! The execution layer of the Cortex agent runtime. `cortex-core` turns an
//! LLM response stream into typed events and validated action graphs; this
//! crate runs them:
//!
//! - **[`scheduler`]** - Dependency-driven concurrent execution with a
//!   global parallelism cap, per-action retry and timeout, skip cascades,
//!   fire-and-forget dispatch, and in-scheduler internal actions
//! - **[`controller`]** - The multi-iteration agent loop: stream, parse,
//!   validate, execute, decide-continue, with wall-clock budgets and
//!   termination predicates
//! - **[`emitter`]** - The single outward event queue: sequence-stamped,
//!   bounded, chunk-coalescing under backpressure
//! - **[`invoker`]** - The collaborator seams (callables and the LLM token
//!   stream); implement these to plug in real tools and transports
//! - **[`cancel`]** - The execution-wide cooperative cancellation handle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cortex_executor::{AgentExecutor, ExecutionConfig};
//! use std::sync::Arc;
//!
//! let executor = AgentExecutor::new(Arc::new(my_invoker), Arc::new(my_llm))
//!     .with_config(ExecutionConfig::default().with_max_parallel(8));
//!
//! let mut handle = executor.start("summarize the incident reports");
//! while let Some(event) = handle.events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! let summary = handle.join().await?;
//! ```

pub mod cancel;
pub mod controller;
pub mod emitter;
pub mod invoker;
pub mod scheduler;

pub use cancel::CancelHandle;
pub use controller::{AgentExecutor, ExecutionHandle};
pub use cortex_core::config::ExecutionConfig;
pub use cortex_core::event::{EventKind, ExecutionEvent, ExecutionSummary};
pub use emitter::EventEmitter;
pub use invoker::{ActionInvoker, InvokeOutcome, Invocation, LlmRequest, TokenStream, TokenStreamProvider};
pub use scheduler::{DagScheduler, MissingRefWarnings, SchedulerReport};

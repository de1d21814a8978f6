//! # cortex-core - Agent Execution Protocol and Data Layer
//!
//! The data and protocol layer of the Cortex agent runtime. This crate
//! turns a structured LLM response stream into typed events and executable
//! action graphs; the sibling `cortex-executor` crate schedules and runs
//! them.
//!
//! ## What lives here
//!
//! - **[`parser`]** - Incremental, push-only state machine over the
//!   `<thought>` / `<action>` / `<response>` / `<context_feed>` protocol,
//!   tolerant of chunk boundaries, split UTF-8 codepoints, and the JSON
//!   defects LLM generators produce inside action bodies
//! - **[`graph`]** - Validated dependency graphs of parsed actions with
//!   cycle detection and wave assignment
//! - **[`resolver`]** - `$name` substitution with native-type promotion
//!   against the result store
//! - **[`store`]** - Per-execution result store, execution variables, and
//!   the context-feed cache
//! - **[`action`]**, **[`event`]**, **[`config`]**, **[`error`]** - The
//!   shared vocabulary: actions and their results, the emitted event
//!   envelope, execution configuration, and the error taxonomy
//!
//! ## Quick Start
//!
//! ```rust
//! use cortex_core::parser::StreamParser;
//! use cortex_core::graph::ActionGraph;
//!
//! let mut parser = StreamParser::new(10);
//! let mut output = parser.feed(
//!     r#"<action type="tool" id="greet">{"name": "echo", "parameters": {"msg": "hi"}}</action>"#,
//! );
//! output.merge(parser.finish());
//!
//! let graph = ActionGraph::build(output.actions)?;
//! assert_eq!(graph.len(), 1);
//! # Ok::<(), cortex_core::error::ValidationError>(())
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod parser;
pub mod resolver;
pub mod store;

pub use action::{Action, ActionFailure, ActionKind, ActionMode, ActionResult, ActionStatus, Backoff, RetryPolicy};
pub use config::ExecutionConfig;
pub use error::{CoreError, Result, ValidationError};
pub use event::{EventKind, ExecutionEvent, ExecutionSummary};
pub use graph::ActionGraph;
pub use store::{ContextFeedSource, FeedKind, ResultStore};

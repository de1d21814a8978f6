//! Execution configuration
//!
//! Configuration is provided once at execution start and applies to every
//! iteration. Defaults match the documented runtime defaults; the builder
//! methods exist for tests and embedders that tune individual knobs.

use crate::action::RetryPolicy;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for one agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on iterations of the agent loop
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget for the whole execution, milliseconds
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,

    /// Wall-clock budget for a single iteration, milliseconds (disabled
    /// when absent)
    #[serde(default)]
    pub iteration_timeout_ms: Option<u64>,

    /// Global cap on concurrently running actions
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout applied to actions that do not override it, milliseconds
    #[serde(default = "default_action_timeout_ms")]
    pub default_action_timeout_ms: u64,

    /// Retry policy applied to actions that do not override it
    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Minimum characters buffered before a thought/response chunk event is
    /// flushed (a newline always flushes)
    #[serde(default = "default_stream_chunk_flush_chars")]
    pub stream_chunk_flush_chars: usize,

    /// Stop when two successive iterations produce no actions and no final
    /// response
    #[serde(default = "default_true")]
    pub terminate_on_no_progress: bool,

    /// Stop when an internal action signals goal achievement
    #[serde(default = "default_true")]
    pub terminate_on_goal_achieved: bool,

    /// Capacity of the outward event queue
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_execution_time_ms() -> u64 {
    3_600_000
}

fn default_max_parallel() -> usize {
    5
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

fn default_stream_chunk_flush_chars() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_event_buffer_capacity() -> usize {
    1024
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_execution_time_ms: default_max_execution_time_ms(),
            iteration_timeout_ms: None,
            max_parallel: default_max_parallel(),
            default_action_timeout_ms: default_action_timeout_ms(),
            default_retry: RetryPolicy::default(),
            stream_chunk_flush_chars: default_stream_chunk_flush_chars(),
            terminate_on_no_progress: default_true(),
            terminate_on_goal_achieved: default_true(),
            event_buffer_capacity: default_event_buffer_capacity(),
        }
    }
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_execution_time_ms(mut self, ms: u64) -> Self {
        self.max_execution_time_ms = ms;
        self
    }

    pub fn with_iteration_timeout_ms(mut self, ms: u64) -> Self {
        self.iteration_timeout_ms = Some(ms);
        self
    }

    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n;
        self
    }

    pub fn with_default_action_timeout_ms(mut self, ms: u64) -> Self {
        self.default_action_timeout_ms = ms;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_stream_chunk_flush_chars(mut self, chars: usize) -> Self {
        self.stream_chunk_flush_chars = chars;
        self
    }

    pub fn with_terminate_on_no_progress(mut self, enabled: bool) -> Self {
        self.terminate_on_no_progress = enabled;
        self
    }

    pub fn with_terminate_on_goal_achieved(mut self, enabled: bool) -> Self {
        self.terminate_on_goal_achieved = enabled;
        self
    }

    pub fn with_event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = capacity;
        self
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(CoreError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(CoreError::Config(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.event_buffer_capacity == 0 {
            return Err(CoreError::Config(
                "event_buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.default_retry.max_attempts == 0 {
            return Err(CoreError::Config(
                "default_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

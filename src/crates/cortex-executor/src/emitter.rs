//! Sequenced event emission
//!
//! The controller is the only component that emits events externally; the
//! parser and the scheduler hand their events here for annotation (sequence
//! number, timestamp, correlation ids) and forwarding. Emission is
//! non-blocking for chunk events: when the bounded queue is full, adjacent
//! thought/response chunks are coalesced and delivered once capacity
//! returns. Lifecycle events are never dropped; a full queue applies
//! backpressure to their emitters instead.
//!
//! Sequence numbers start at 0 and are assigned under the emitter lock at
//! the moment an event is handed to the channel, so queue order always
//! equals `seq` order.

use chrono::Utc;
use cortex_core::event::{EventKind, ExecutionEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Most deferred chunk events held while the queue is saturated; beyond
/// this the oldest is dropped.
const MAX_DEFERRED_CHUNKS: usize = 1024;

struct EmitterState {
    seq: u64,
    /// Chunk events deferred by backpressure, oldest first
    deferred: VecDeque<(Option<u32>, EventKind)>,
    dropped_chunks: u64,
}

struct EmitterInner {
    execution_id: String,
    tx: mpsc::Sender<ExecutionEvent>,
    state: Mutex<EmitterState>,
    /// Current iteration for correlation; 0 means execution-scoped
    iteration: AtomicU32,
}

/// Cloneable handle used by the controller, the scheduler and its workers
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    /// Create an emitter and the receiver handed to the execution's
    /// subscriber.
    pub fn channel(
        execution_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let emitter = Self {
            inner: Arc::new(EmitterInner {
                execution_id: execution_id.into(),
                tx,
                state: Mutex::new(EmitterState {
                    seq: 0,
                    deferred: VecDeque::new(),
                    dropped_chunks: 0,
                }),
                iteration: AtomicU32::new(0),
            }),
        };
        (emitter, rx)
    }

    /// Set the iteration stamped onto subsequent events.
    pub fn set_iteration(&self, iteration: u32) {
        self.inner.iteration.store(iteration, Ordering::SeqCst);
    }

    /// Clear the iteration stamp for execution-scoped events.
    pub fn clear_iteration(&self) {
        self.inner.iteration.store(0, Ordering::SeqCst);
    }

    fn current_iteration(&self) -> Option<u32> {
        match self.inner.iteration.load(Ordering::SeqCst) {
            0 => None,
            i => Some(i),
        }
    }

    /// Emit one event. Chunk events may be deferred and coalesced under
    /// backpressure; lifecycle events wait for capacity and are never
    /// dropped. Returns once the event is queued (or coalesced).
    pub async fn emit(&self, kind: EventKind) {
        let iteration = self.current_iteration();

        {
            let mut state = self.inner.state.lock();
            self.flush_deferred_locked(&mut state);

            if state.deferred.is_empty() {
                match self.inner.tx.try_reserve() {
                    Ok(permit) => {
                        let event = self.stamp(&mut state, iteration, kind);
                        permit.send(event);
                        return;
                    }
                    // Subscriber went away; drop silently from here on.
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                }
            }

            if kind.is_chunk() {
                self.defer_chunk_locked(&mut state, iteration, kind);
                return;
            }
        }

        // Lifecycle event under backpressure: wait for capacity, draining
        // older deferred chunks first so intra-thought order holds.
        loop {
            let Ok(permit) = self.inner.tx.reserve().await else {
                return;
            };
            let mut state = self.inner.state.lock();
            if let Some((deferred_iteration, chunk)) = state.deferred.pop_front() {
                let event = self.stamp(&mut state, deferred_iteration, chunk);
                permit.send(event);
                continue;
            }
            let event = self.stamp(&mut state, iteration, kind);
            permit.send(event);
            return;
        }
    }

    fn stamp(
        &self,
        state: &mut EmitterState,
        iteration: Option<u32>,
        kind: EventKind,
    ) -> ExecutionEvent {
        let seq = state.seq;
        state.seq += 1;
        ExecutionEvent {
            seq,
            ts: Utc::now(),
            execution_id: self.inner.execution_id.clone(),
            iteration,
            kind,
        }
    }

    fn flush_deferred_locked(&self, state: &mut EmitterState) {
        while let Some((iteration, _)) = state.deferred.front() {
            match self.inner.tx.try_reserve() {
                Ok(permit) => {
                    let iteration = *iteration;
                    let (_, kind) = state
                        .deferred
                        .pop_front()
                        .expect("front checked non-empty");
                    let event = self.stamp(state, iteration, kind);
                    permit.send(event);
                }
                Err(_) => break,
            }
        }
    }

    fn defer_chunk_locked(
        &self,
        state: &mut EmitterState,
        iteration: Option<u32>,
        kind: EventKind,
    ) {
        // Coalesce with the newest deferred chunk of the same shape.
        if let Some((back_iteration, back)) = state.deferred.back_mut() {
            if *back_iteration == iteration {
                match (back, &kind) {
                    (
                        EventKind::ThoughtChunk { text: existing },
                        EventKind::ThoughtChunk { text },
                    )
                    | (
                        EventKind::ResponseChunk { text: existing },
                        EventKind::ResponseChunk { text },
                    ) => {
                        existing.push_str(text);
                        return;
                    }
                    _ => {}
                }
            }
        }

        state.deferred.push_back((iteration, kind));
        if state.deferred.len() > MAX_DEFERRED_CHUNKS {
            state.deferred.pop_front();
            state.dropped_chunks += 1;
            if state.dropped_chunks.is_power_of_two() {
                warn!(
                    dropped = state.dropped_chunks,
                    "event subscriber too slow; dropping oldest chunk events"
                );
            }
        }
    }

}

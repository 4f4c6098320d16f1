//! Request and completion types for inference scheduling

use crate::{InputTensor, OutputTensor, RequestId, ScheduleError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Final outcome delivered to a request's completion callback
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Request this outcome corresponds to
    pub request_id: RequestId,
    /// Terminal status: `Ok` with outputs, or the failure that ended the request
    pub status: Result<(), ScheduleError>,
    /// Output tensors, one set per request (empty on failure)
    pub outputs: Vec<OutputTensor>,
    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}

impl RequestOutcome {
    /// Whether the request completed successfully
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Completion callback sink invoked exactly once per request
pub type ResponseSink = Box<dyn FnOnce(RequestOutcome) + Send + 'static>;

/// Single-use completion handle carried by every request
///
/// The inner sink is consumed on first use; a second `send` is a warned
/// no-op, which keeps the at-most-once response invariant even on buggy
/// executor paths.
pub struct Responder {
    sink: Option<ResponseSink>,
}

impl Responder {
    /// Wrap an arbitrary callback as the completion sink
    pub fn new(sink: ResponseSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// Create a channel-backed responder, returning the receiving half
    ///
    /// Convenient for tests and simple front-ends that want to block on the
    /// response rather than react to a callback.
    pub fn channel() -> (Self, mpsc::Receiver<RequestOutcome>) {
        let (tx, rx) = mpsc::channel();
        let responder = Self::new(Box::new(move |outcome| {
            // Receiver may be gone if the caller stopped waiting
            let _ = tx.send(outcome);
        }));
        (responder, rx)
    }

    /// Deliver the outcome; may be called from any worker thread
    pub fn send(&mut self, outcome: RequestOutcome) {
        match self.sink.take() {
            Some(sink) => sink(outcome),
            None => {
                tracing::warn!(
                    request_id = %outcome.request_id,
                    "dropping duplicate response for request"
                );
            }
        }
    }

    /// Whether the sink has already been consumed
    pub fn is_spent(&self) -> bool {
        self.sink.is_none()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// One inference job
///
/// The header fields (`id`, `priority`, `batch_size`, `timeout`, `inputs`)
/// are immutable after creation. `sequence`, `enqueued_at` and `deadline`
/// are stamped by the scheduler at enqueue time and belong to it from then
/// on; the staged completion state is written by the execution callable and
/// published by the scheduler through `respond`.
#[derive(Debug)]
pub struct InferenceRequest {
    /// Unique request identifier
    pub id: RequestId,
    /// Priority level; 0 is the highest
    pub priority: u32,
    /// Batch-dimension contribution of this request (>= 1)
    pub batch_size: u32,
    /// Optional per-request queue timeout, honored when the level policy allows
    pub timeout: Option<Duration>,
    /// Named inputs with declared shapes
    pub inputs: Vec<InputTensor>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Enqueue sequence number, assigned under the scheduler mutex
    pub sequence: u64,
    /// Monotonic enqueue timestamp, stamped at enqueue
    pub enqueued_at: Option<Instant>,
    /// Effective queue deadline, computed from the level policy at enqueue
    pub deadline: Option<Instant>,

    /// Outputs staged by the execution callable before publication
    pub staged_outputs: Vec<OutputTensor>,
    /// Per-request failure staged by the execution callable
    pub staged_error: Option<ScheduleError>,

    responder: Responder,
}

impl InferenceRequest {
    /// Create a request with the given inputs and completion sink
    pub fn new(inputs: Vec<InputTensor>, responder: Responder) -> Self {
        Self {
            id: RequestId::new(),
            priority: 0,
            batch_size: 1,
            timeout: None,
            inputs,
            created_at: Utc::now(),
            sequence: 0,
            enqueued_at: None,
            deadline: None,
            staged_outputs: Vec::new(),
            staged_error: None,
            responder,
        }
    }

    /// Set the priority level
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the batch-dimension contribution
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set a per-request queue timeout override
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enqueue sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Look up an input by name
    pub fn input(&self, name: &str) -> Option<&InputTensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Time spent in the queue as of `now`
    pub fn age(&self, now: Instant) -> Duration {
        self.enqueued_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// Whether the effective queue deadline has elapsed
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Stage output tensors for publication (called by the executor)
    pub fn set_outputs(&mut self, outputs: Vec<OutputTensor>) {
        self.staged_outputs = outputs;
    }

    /// Stage a per-request failure for publication (called by the executor)
    pub fn fail(&mut self, error: ScheduleError) {
        self.staged_error = Some(error);
    }

    /// Publish the terminal outcome, consuming the request
    ///
    /// May be invoked from any worker thread. Ownership transfers to the
    /// completion callback here.
    pub fn respond(mut self, status: Result<(), ScheduleError>, outputs: Vec<OutputTensor>) {
        let outcome = RequestOutcome {
            request_id: self.id.clone(),
            status,
            outputs,
            completed_at: Utc::now(),
        };
        self.responder.send(outcome);
    }

    /// Publish whatever the executor staged, honoring a batch-level status
    ///
    /// A batch-level error overrides any staged outputs: every request in the
    /// batch reports that error individually.
    pub fn publish_staged(mut self, batch_status: &Result<(), ScheduleError>) {
        let (status, outputs) = match batch_status {
            Err(e) => (Err(e.clone()), Vec::new()),
            Ok(()) => match self.staged_error.take() {
                Some(e) => (Err(e), Vec::new()),
                None => (Ok(()), std::mem::take(&mut self.staged_outputs)),
            },
        };
        self.respond(status, outputs);
    }
}

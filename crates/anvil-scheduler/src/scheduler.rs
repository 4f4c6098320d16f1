//! Scheduler facade
//!
//! Public surface of the dynamic batching scheduler: construction wires the
//! queue, assembler, runner pool and completion orderer together; `enqueue`
//! is the single entry point for work. Destruction signals the runners,
//! joins them, and drains residual requests with a shutting-down failure.

use crate::batch::BatchAssembler;
use crate::clock::{Clock, MonotonicClock};
use crate::metrics::{MetricsSnapshot, SchedulerMetricsCollector};
use crate::ordering::CompletionOrderer;
use crate::queue::{PriorityQueue, PushOutcome};
use crate::worker::WorkerPool;
use anvil_types::{InferenceRequest, ScheduleError, SchedulerConfig};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, info};

/// Runner initialisation callback; a failure aborts scheduler construction
pub type InitFn = dyn Fn(usize) -> Result<(), ScheduleError> + Send + Sync;
/// Optional runner warmup callback, invoked after successful init
pub type WarmupFn = dyn Fn(usize) -> Result<(), ScheduleError> + Send + Sync;
/// Execution callable: runs a batch and stages per-request outcomes
///
/// Receives the runner id and the batch in enqueue order. Stages results via
/// [`InferenceRequest::set_outputs`] / [`InferenceRequest::fail`]; the
/// returned status reports batch-level failure, which the scheduler fans out
/// to every request. Must be thread-safe across runner ids and must not call
/// back into `enqueue` on the same scheduler.
pub type ExecuteFn =
    dyn Fn(usize, &mut [InferenceRequest]) -> Result<(), ScheduleError> + Send + Sync;

/// The three functions injected by the host
pub struct Callbacks {
    pub on_init: Option<Box<InitFn>>,
    pub on_warmup: Option<Box<WarmupFn>>,
    pub on_schedule: Box<ExecuteFn>,
}

impl Callbacks {
    /// Callbacks with only an execution callable
    pub fn new<F>(on_schedule: F) -> Self
    where
        F: Fn(usize, &mut [InferenceRequest]) -> Result<(), ScheduleError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            on_init: None,
            on_warmup: None,
            on_schedule: Box::new(on_schedule),
        }
    }

    pub fn with_init<F>(mut self, on_init: F) -> Self
    where
        F: Fn(usize) -> Result<(), ScheduleError> + Send + Sync + 'static,
    {
        self.on_init = Some(Box::new(on_init));
        self
    }

    pub fn with_warmup<F>(mut self, on_warmup: F) -> Self
    where
        F: Fn(usize) -> Result<(), ScheduleError> + Send + Sync + 'static,
    {
        self.on_warmup = Some(Box::new(on_warmup));
        self
    }
}

/// State guarded by the single scheduler mutex
pub(crate) struct SchedState {
    pub queue: PriorityQueue,
    /// Next enqueue sequence number
    pub next_sequence: u64,
    /// Next completion ticket; issued at dispatch under this mutex
    pub next_ticket: u64,
    /// Set by the destructor before joining workers
    pub exiting: bool,
}

/// Shared innards handed to every worker
pub(crate) struct SchedulerCore {
    pub config: SchedulerConfig,
    pub clock: Arc<dyn Clock>,
    pub callbacks: Callbacks,
    pub assembler: BatchAssembler,
    pub state: Mutex<SchedState>,
    pub work_available: Condvar,
    pub orderer: Option<CompletionOrderer>,
    pub metrics: SchedulerMetricsCollector,
}

/// Dynamic batching scheduler
///
/// Accepts inference requests, batches them subject to shape and priority
/// constraints, and dispatches to a pool of runner threads.
pub struct DynamicBatchScheduler {
    core: Arc<SchedulerCore>,
    workers: Option<WorkerPool>,
}

impl DynamicBatchScheduler {
    /// Create a scheduler with the default monotonic clock
    pub fn create(config: SchedulerConfig, callbacks: Callbacks) -> Result<Self, ScheduleError> {
        Self::create_with_clock(config, callbacks, Arc::new(MonotonicClock))
    }

    /// Create a scheduler with an injected clock
    ///
    /// Blocks until every runner has signalled initialised-or-failed.
    pub fn create_with_clock(
        config: SchedulerConfig,
        callbacks: Callbacks,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ScheduleError> {
        config.validate()?;
        info!(
            runner_count = config.runner_count,
            max_batch_size = config.max_batch_size,
            dynamic_batching = config.dynamic_batching_enabled,
            preserve_ordering = config.preserve_ordering,
            "creating dynamic batch scheduler"
        );

        let queue = PriorityQueue::new(&config);
        let assembler = BatchAssembler::new(&config);
        let orderer = config.preserve_ordering.then(CompletionOrderer::new);

        let core = Arc::new(SchedulerCore {
            clock,
            callbacks,
            assembler,
            state: Mutex::new(SchedState {
                queue,
                next_sequence: 0,
                next_ticket: 0,
                exiting: false,
            }),
            work_available: Condvar::new(),
            orderer,
            metrics: SchedulerMetricsCollector::new(),
            config,
        });

        let workers = WorkerPool::spawn(&core)?;
        Ok(Self {
            core,
            workers: Some(workers),
        })
    }

    /// Submit a request for scheduling
    ///
    /// Thread-safe; blocks only on the scheduler mutex. On any failure the
    /// request is failed through its own completion callback and the same
    /// status is returned to the caller.
    pub fn enqueue(&self, mut request: InferenceRequest) -> Result<(), ScheduleError> {
        let outcome = {
            let mut state = self.core.state.lock();
            if state.exiting {
                drop(state);
                self.core.metrics.record_rejected();
                request.respond(Err(ScheduleError::ShuttingDown), Vec::new());
                return Err(ScheduleError::ShuttingDown);
            }

            let levels = self.core.config.priority_levels;
            if request.priority >= levels {
                drop(state);
                let error = ScheduleError::invalid_priority(request.priority, levels);
                self.core.metrics.record_rejected();
                request.respond(Err(error.clone()), Vec::new());
                return Err(error);
            }

            let now = self.core.clock.now();
            request.sequence = state.next_sequence;
            state.next_sequence += 1;
            request.enqueued_at = Some(now);
            let policy = self.core.config.policy_for_level(request.priority);
            request.deadline = policy
                .effective_timeout(request.timeout)
                .map(|timeout| now + timeout);

            let outcome = state.queue.push(request);
            if !matches!(outcome, PushOutcome::Rejected(_)) {
                self.core.work_available.notify_one();
            }
            outcome
        };

        // Failure callbacks run outside the mutex
        match outcome {
            PushOutcome::Accepted => {
                self.core.metrics.record_enqueued();
                Ok(())
            }
            PushOutcome::AcceptedDisplacing(displaced) => {
                self.core.metrics.record_enqueued();
                self.core.metrics.record_displaced();
                debug!(request_id = %displaced.id, "notifying displaced request");
                displaced.respond(
                    Err(ScheduleError::queue_displaced(
                        "displaced by newer request at a full priority level",
                    )),
                    Vec::new(),
                );
                Ok(())
            }
            PushOutcome::Rejected(rejected) => {
                self.core.metrics.record_rejected();
                let error = ScheduleError::queue_full(format!(
                    "priority level {} is at capacity",
                    rejected.priority
                ));
                rejected.respond(Err(error.clone()), Vec::new());
                Err(error)
            }
        }
    }

    /// Number of requests currently queued
    pub fn queued(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    /// Point-in-time metrics view
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }
}

impl Drop for DynamicBatchScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.core.state.lock();
            state.exiting = true;
        }
        if let Some(mut workers) = self.workers.take() {
            workers.shutdown(&self.core);
        }

        // Workers are gone; fail everything still queued
        let residual = {
            let mut state = self.core.state.lock();
            state.queue.drain()
        };
        if !residual.is_empty() {
            info!(residual = residual.len(), "draining queue at shutdown");
            self.core.metrics.record_drained(residual.len());
            for request in residual {
                request.respond(Err(ScheduleError::ShuttingDown), Vec::new());
            }
        }
        debug!("scheduler shut down");
    }
}

//! Runner thread pool
//!
//! Each worker is an OS thread bound to a runner id. A worker loops:
//! expire the queue, ask the assembler for a batch, and either sleep on the
//! condition variable (wait-for-work or wait-for-batch-delay) or take
//! ownership of the admitted requests, release the mutex, and run the
//! injected execution callable. Responses are published directly or through
//! the completion orderer.

use crate::batch::BatchDecision;
use crate::ordering::{self, FinishedBatch};
use crate::scheduler::SchedulerCore;
use anvil_types::{BatchId, InferenceRequest, ScheduleError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Handles and exit flags for the spawned runners
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    exit_flags: Vec<Arc<AtomicBool>>,
}

impl WorkerPool {
    /// Spawn `runner_count` workers and block until each has signalled
    /// initialised-or-failed; any init failure aborts construction.
    pub(crate) fn spawn(core: &Arc<SchedulerCore>) -> Result<Self, ScheduleError> {
        let runner_count = core.config.runner_count;
        let (init_tx, init_rx) = mpsc::channel();
        let mut pool = Self {
            handles: Vec::with_capacity(runner_count),
            exit_flags: Vec::with_capacity(runner_count),
        };

        for runner_id in 0..runner_count {
            let exit = Arc::new(AtomicBool::new(false));
            let worker_core = Arc::clone(core);
            let worker_exit = Arc::clone(&exit);
            let worker_init_tx = init_tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("anvil-runner-{runner_id}"))
                .spawn(move || {
                    apply_nice(worker_core.config.runner_nice);

                    let init_result = match &worker_core.callbacks.on_init {
                        Some(on_init) => on_init(runner_id),
                        None => Ok(()),
                    };
                    let initialised = init_result.is_ok();
                    let _ = worker_init_tx.send(init_result);
                    if !initialised {
                        return;
                    }

                    if let Some(on_warmup) = &worker_core.callbacks.on_warmup {
                        if let Err(error) = on_warmup(runner_id) {
                            warn!(runner_id, %error, "runner warmup failed");
                        }
                    }

                    debug!(runner_id, "runner entering scheduling loop");
                    run_worker(worker_core, runner_id, worker_exit);
                    debug!(runner_id, "runner exited");
                });

            match spawned {
                Ok(handle) => {
                    pool.handles.push(handle);
                    pool.exit_flags.push(exit);
                }
                Err(error) => {
                    pool.shutdown(core);
                    return Err(ScheduleError::internal(format!(
                        "failed to spawn runner {runner_id}: {error}"
                    )));
                }
            }
        }
        drop(init_tx);

        for _ in 0..runner_count {
            match init_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(%error, "runner initialisation failed, aborting scheduler");
                    pool.shutdown(core);
                    return Err(error);
                }
                Err(_) => {
                    pool.shutdown(core);
                    return Err(ScheduleError::internal(
                        "runner exited before signalling initialisation",
                    ));
                }
            }
        }

        info!(runner_count, "runner pool initialised");
        Ok(pool)
    }

    /// Signal every worker to exit, wake them, and join
    pub(crate) fn shutdown(&mut self, core: &SchedulerCore) {
        for flag in &self.exit_flags {
            flag.store(true, Ordering::Release);
        }
        core.work_available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Best-effort OS scheduling hint, applied once per worker at startup
#[cfg(unix)]
fn apply_nice(nice: i32) {
    if nice == 0 {
        return;
    }
    // who = 0 targets the calling thread on Linux
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        debug!(nice, "could not apply runner nice value");
    }
}

#[cfg(not(unix))]
fn apply_nice(_nice: i32) {}

/// The scheduling loop for one runner
fn run_worker(core: Arc<SchedulerCore>, runner_id: usize, exit: Arc<AtomicBool>) {
    loop {
        let mut failures: Vec<(InferenceRequest, ScheduleError)> = Vec::new();
        let mut dispatch: Option<(Vec<InferenceRequest>, Option<u64>)> = None;

        {
            let mut state = core.state.lock();
            loop {
                if exit.load(Ordering::Acquire) {
                    break;
                }
                let now = core.clock.now();
                for request in state.queue.expire(now) {
                    failures.push((request, timed_out_error()));
                }

                let assembly = core.assembler.assemble(&mut state.queue, now);
                for request in assembly.timed_out {
                    failures.push((request, timed_out_error()));
                }
                for request in assembly.rejected {
                    let error = ScheduleError::shape_mismatch(format!(
                        "request batch size {} exceeds model max batch size {}",
                        request.batch_size, core.config.max_batch_size
                    ));
                    failures.push((request, error));
                }

                match assembly.decision {
                    BatchDecision::Dispatch(requests) => {
                        // Ticket drawn under the scheduler mutex, so tickets
                        // match dispatch order deterministically.
                        let ticket = core.orderer.as_ref().map(|_| {
                            let ticket = state.next_ticket;
                            state.next_ticket += 1;
                            ticket
                        });
                        dispatch = Some((requests, ticket));
                        break;
                    }
                    BatchDecision::Empty => {
                        if !failures.is_empty() {
                            // Flush failure callbacks before sleeping
                            break;
                        }
                        core.work_available.wait(&mut state);
                    }
                    BatchDecision::Wait { deadline } => {
                        if !failures.is_empty() {
                            break;
                        }
                        let now = core.clock.now();
                        if deadline > now {
                            core.work_available.wait_for(&mut state, deadline - now);
                        }
                        // Re-check the guard on every wakeup; spurious
                        // wakeups and early enqueue signals both land here.
                    }
                }
            }
        }

        for (request, error) in failures {
            match &error {
                ScheduleError::TimedOut { .. } => core.metrics.record_timed_out(),
                ScheduleError::ShapeMismatch { .. } => core.metrics.record_shape_mismatch(),
                _ => {}
            }
            debug!(request_id = %request.id, %error, "failing request");
            request.respond(Err(error), Vec::new());
        }

        match dispatch {
            Some((requests, ticket)) => execute_batch(&core, runner_id, requests, ticket),
            None => {
                if exit.load(Ordering::Acquire) {
                    return;
                }
            }
        }
    }
}

fn timed_out_error() -> ScheduleError {
    ScheduleError::timed_out("request exceeded its queue timeout")
}

/// Run the execution callable and publish the finished batch
///
/// Unexpected faults never unwind past the worker: a panic inside the
/// callable marks every request in the batch with `execute-failed` and the
/// loop continues.
fn execute_batch(
    core: &Arc<SchedulerCore>,
    runner_id: usize,
    mut requests: Vec<InferenceRequest>,
    ticket: Option<u64>,
) {
    let batch_id = BatchId::new();
    debug!(
        runner_id,
        %batch_id,
        batch_size = requests.len(),
        ticket,
        "executing batch"
    );

    let status = catch_unwind(AssertUnwindSafe(|| {
        (core.callbacks.on_schedule)(runner_id, &mut requests)
    }))
    .unwrap_or_else(|_| {
        warn!(runner_id, "execution callable panicked");
        Err(ScheduleError::execute_failed("execution callable panicked"))
    });

    core.metrics
        .record_batch_executed(requests.len(), status.is_err());

    let finished = FinishedBatch { requests, status };
    match (&core.orderer, ticket) {
        (Some(orderer), Some(ticket)) => orderer.deposit(ticket, finished),
        _ => ordering::publish(finished),
    }
}

//! Batch assembly policy
//!
//! Given the head of the priority queue, decides which contiguous prefix of
//! its level becomes the next batch. The head request pins a template of
//! required-equal input shapes (and shape-tensor contents); subsequent
//! requests are admitted in queue order until one fails the constraints or
//! the model's batch capacity is reached. Growth toward a preferred batch
//! size is bounded by the configured queue delay.

use crate::queue::PriorityQueue;
use anvil_types::{InferenceRequest, SchedulerConfig};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of one assembly attempt
#[derive(Debug)]
pub enum BatchDecision {
    /// Admitted requests, in enqueue order, ready to run
    Dispatch(Vec<InferenceRequest>),
    /// Keep the pending requests queued and retry at the deadline
    Wait { deadline: Instant },
    /// Nothing queued
    Empty,
}

/// Assembly result: the decision plus any requests evicted along the way
///
/// Evicted requests are handed back so the worker can fail them outside the
/// scheduler mutex.
#[derive(Debug)]
pub struct Assembly {
    pub decision: BatchDecision,
    /// Requests whose queue deadline elapsed mid-queue
    pub timed_out: Vec<InferenceRequest>,
    /// Requests whose own batch dimension exceeds the model capacity
    pub rejected: Vec<InferenceRequest>,
}

/// Equality requirement pinned from the head request, one per constrained input
enum InputConstraint {
    /// Declared shape must match
    ShapeEqual(Vec<i64>),
    /// Shape tensor: declared shape and numeric contents must match
    ShapeAndContentsEqual(Vec<i64>, Vec<u8>),
}

struct TemplateInput {
    name: String,
    constraint: InputConstraint,
}

/// Transient state accumulated while walking candidates
struct PendingBatch {
    template: Vec<TemplateInput>,
    /// Sum of admitted batch-dimension contributions
    size: u32,
    /// Number of admitted requests (a contiguous level prefix)
    admitted: usize,
    /// Enqueue time of the head request; anchors the delay budget
    head_enqueued: Option<Instant>,
}

impl PendingBatch {
    fn capture(head: &InferenceRequest, enforce: &[(String, bool)]) -> Self {
        let mut template = Vec::with_capacity(enforce.len());
        for (name, is_shape_tensor) in enforce {
            // An input the head itself lacks pins nothing
            if let Some(input) = head.input(name) {
                let constraint = if *is_shape_tensor {
                    InputConstraint::ShapeAndContentsEqual(input.shape.clone(), input.data.clone())
                } else {
                    InputConstraint::ShapeEqual(input.shape.clone())
                };
                template.push(TemplateInput {
                    name: name.clone(),
                    constraint,
                });
            }
        }
        Self {
            template,
            size: head.batch_size,
            admitted: 1,
            head_enqueued: head.enqueued_at,
        }
    }

    /// Whether a candidate satisfies every pinned constraint
    fn admits(&self, candidate: &InferenceRequest) -> bool {
        self.template.iter().all(|entry| {
            let Some(input) = candidate.input(&entry.name) else {
                return false;
            };
            match &entry.constraint {
                InputConstraint::ShapeEqual(shape) => input.shape == *shape,
                InputConstraint::ShapeAndContentsEqual(shape, data) => {
                    input.shape == *shape && input.data == *data
                }
            }
        })
    }
}

/// Decides the contents of the next batch to dispatch
///
/// Called by a worker holding an exclusive claim on the scheduler mutex;
/// only the admitted prefix is removed before the mutex is released.
pub struct BatchAssembler {
    dynamic_batching_enabled: bool,
    max_batch_size: u32,
    preferred_batch_sizes: BTreeSet<u32>,
    max_queue_delay: Duration,
    /// Constrained inputs in a stable order, hoisted out of the admission loop
    enforce: Vec<(String, bool)>,
}

impl BatchAssembler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let mut enforce: Vec<(String, bool)> = config
            .enforce_equal_shape_tensors
            .iter()
            .map(|(name, flag)| (name.clone(), *flag))
            .collect();
        enforce.sort();
        Self {
            dynamic_batching_enabled: config.dynamic_batching_enabled,
            max_batch_size: config.max_batch_size,
            preferred_batch_sizes: config.preferred_batch_sizes.clone(),
            max_queue_delay: config.max_queue_delay,
            enforce,
        }
    }

    /// Run one assembly attempt against the queue
    pub fn assemble(&self, queue: &mut PriorityQueue, now: Instant) -> Assembly {
        let mut timed_out = Vec::new();
        let mut rejected = Vec::new();

        let Some(level) = queue.head_level() else {
            return Assembly {
                decision: BatchDecision::Empty,
                timed_out,
                rejected,
            };
        };

        let mut pending: Option<PendingBatch> = None;
        let mut index = 0;
        while let Some(candidate) = queue.get_at(level, index) {
            // Catches override-shortened deadlines the front-scan cannot see
            if candidate.is_expired(now) {
                timed_out.push(queue.remove_at(level, index).expect("candidate present"));
                continue;
            }

            match pending.as_mut() {
                None => {
                    // The head defines the template. A head that alone exceeds
                    // the model capacity can never dispatch; evict it.
                    if candidate.batch_size > self.max_batch_size {
                        rejected.push(queue.remove_at(level, index).expect("candidate present"));
                        continue;
                    }
                    pending = Some(PendingBatch::capture(candidate, &self.enforce));
                    index += 1;
                    if !self.dynamic_batching_enabled {
                        break;
                    }
                }
                Some(batch) => {
                    if batch.size + candidate.batch_size > self.max_batch_size
                        || !batch.admits(candidate)
                    {
                        // Do not reorder past an inadmissible request; it
                        // stays queued and heads the next attempt.
                        break;
                    }
                    batch.size += candidate.batch_size;
                    batch.admitted += 1;
                    index += 1;
                }
            }

            if pending.as_ref().is_some_and(|b| b.size >= self.max_batch_size) {
                break;
            }
        }

        let Some(batch) = pending else {
            // Every walked request was evicted; the worker flushes the
            // failures and retries.
            return Assembly {
                decision: BatchDecision::Empty,
                timed_out,
                rejected,
            };
        };

        let decision = self.decide(queue, batch, now);
        Assembly {
            decision,
            timed_out,
            rejected,
        }
    }

    fn decide(&self, queue: &mut PriorityQueue, batch: PendingBatch, now: Instant) -> BatchDecision {
        if !self.dynamic_batching_enabled {
            return BatchDecision::Dispatch(self.take(queue, 1));
        }
        if batch.size >= self.max_batch_size {
            return BatchDecision::Dispatch(self.take(queue, batch.admitted));
        }
        // With no preferred sizes every size is equally good; dispatch now.
        if self.preferred_batch_sizes.is_empty()
            || self.preferred_batch_sizes.contains(&batch.size)
        {
            return BatchDecision::Dispatch(self.take(queue, batch.admitted));
        }

        let next_preferred = self
            .preferred_batch_sizes
            .range(batch.size..)
            .next()
            .copied();
        match next_preferred {
            None => {
                // Accumulated past every preferred size: dispatch at the
                // largest preferred size and leave the excess queued.
                let target = self
                    .preferred_batch_sizes
                    .iter()
                    .next_back()
                    .copied()
                    .expect("preferred set is non-empty");
                let count = self.prefix_for_target(queue, batch.admitted, target);
                debug!(
                    accumulated = batch.size,
                    target, count, "truncating batch to largest preferred size"
                );
                BatchDecision::Dispatch(self.take(queue, count))
            }
            Some(preferred) => {
                // A larger preferred size is reachable; spend the delay
                // budget waiting for peers, anchored to the head's age.
                let head_enqueued = batch.head_enqueued.unwrap_or(now);
                let deadline = head_enqueued + self.max_queue_delay;
                if now >= deadline {
                    trace!(
                        size = batch.size,
                        preferred, "delay budget exhausted, dispatching partial batch"
                    );
                    BatchDecision::Dispatch(self.take(queue, batch.admitted))
                } else {
                    BatchDecision::Wait { deadline }
                }
            }
        }
    }

    /// Longest admitted prefix whose accumulated size fits `target`,
    /// always keeping at least the head
    fn prefix_for_target(&self, queue: &PriorityQueue, admitted: usize, target: u32) -> usize {
        let level = queue.head_level().expect("admitted prefix is queued");
        let mut size = 0;
        let mut count = 0;
        for index in 0..admitted {
            let request = queue.get_at(level, index).expect("prefix within level");
            if count > 0 && size + request.batch_size > target {
                break;
            }
            size += request.batch_size;
            count += 1;
        }
        count
    }

    /// Remove the admitted prefix from the queue head
    fn take(&self, queue: &mut PriorityQueue, count: usize) -> Vec<InferenceRequest> {
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            requests.push(queue.pop_head().expect("admitted prefix is queued"));
        }
        requests
    }
}

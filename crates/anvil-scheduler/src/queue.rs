//! Multi-level priority queue for pending requests
//!
//! A mapping from priority level to an ordered run of requests. Within a
//! level, requests are FIFO by enqueue sequence; across levels, a
//! lower-numbered level is always eligible before a higher-numbered one.
//! Each level carries its own depth limit, timeout, and overflow action.

use anvil_types::{InferenceRequest, OverflowAction, SchedulerConfig};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::debug;

/// Result of pushing a request into the queue
#[derive(Debug)]
pub enum PushOutcome {
    /// Request accepted at the tail of its level
    Accepted,
    /// Request accepted; the displaced oldest request is returned so its
    /// caller can be notified
    AcceptedDisplacing(InferenceRequest),
    /// Level was full and the policy rejects new work; the request is
    /// handed back for failure notification
    Rejected(InferenceRequest),
}

struct Level {
    requests: VecDeque<InferenceRequest>,
    max_queue_size: usize,
    overflow_action: OverflowAction,
}

/// Queue of pending requests, one FIFO per priority level
///
/// A request sits in exactly one level, or has been popped (and is owned by
/// a runner), or has been notified of failure. Total size is the sum of the
/// per-level sizes.
pub struct PriorityQueue {
    levels: BTreeMap<u32, Level>,
    size: usize,
}

impl PriorityQueue {
    /// Build the level map eagerly from the configured policies
    pub fn new(config: &SchedulerConfig) -> Self {
        let levels = (0..config.priority_levels)
            .map(|level| {
                let policy = config.policy_for_level(level);
                (
                    level,
                    Level {
                        requests: VecDeque::new(),
                        max_queue_size: policy.max_queue_size,
                        overflow_action: policy.overflow_action,
                    },
                )
            })
            .collect();
        Self { levels, size: 0 }
    }

    /// Total number of queued requests across all levels
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Place a request at the tail of its priority level
    ///
    /// The caller must already have stamped `enqueued_at` and the effective
    /// `deadline`. The priority is assumed validated against the level count.
    pub fn push(&mut self, request: InferenceRequest) -> PushOutcome {
        let level = self
            .levels
            .get_mut(&request.priority)
            .expect("priority validated against configured levels");

        if level.max_queue_size > 0 && level.requests.len() >= level.max_queue_size {
            match level.overflow_action {
                OverflowAction::RejectNew => {
                    debug!(
                        request_id = %request.id,
                        priority = request.priority,
                        "level full, rejecting request"
                    );
                    return PushOutcome::Rejected(request);
                }
                OverflowAction::RejectOldest => {
                    let displaced = level
                        .requests
                        .pop_front()
                        .expect("full level has a front request");
                    debug!(
                        displaced = %displaced.id,
                        admitted = %request.id,
                        priority = request.priority,
                        "level full, displacing oldest request"
                    );
                    level.requests.push_back(request);
                    return PushOutcome::AcceptedDisplacing(displaced);
                }
                OverflowAction::Delay => {
                    // soft bound; fall through and admit
                }
            }
        }

        level.requests.push_back(request);
        self.size += 1;
        PushOutcome::Accepted
    }

    /// Lowest-numbered level that has queued work
    pub fn head_level(&self) -> Option<u32> {
        self.levels
            .iter()
            .find(|(_, level)| !level.requests.is_empty())
            .map(|(priority, _)| *priority)
    }

    /// Oldest request in the lowest non-empty level
    pub fn peek_head(&self) -> Option<&InferenceRequest> {
        self.levels
            .values()
            .find_map(|level| level.requests.front())
    }

    /// Remove and return the head request
    pub fn pop_head(&mut self) -> Option<InferenceRequest> {
        let request = self
            .levels
            .values_mut()
            .find_map(|level| level.requests.pop_front());
        if request.is_some() {
            self.size -= 1;
        }
        request
    }

    /// Number of requests queued at one level
    pub fn len_at(&self, priority: u32) -> usize {
        self.levels
            .get(&priority)
            .map_or(0, |level| level.requests.len())
    }

    /// Request at a position within one level, front first
    pub fn get_at(&self, priority: u32, index: usize) -> Option<&InferenceRequest> {
        self.levels
            .get(&priority)
            .and_then(|level| level.requests.get(index))
    }

    /// Remove the request at a position within one level
    ///
    /// Used by the batch assembler to evict expired or malformed requests it
    /// encounters mid-walk; removal never reorders the survivors.
    pub fn remove_at(&mut self, priority: u32, index: usize) -> Option<InferenceRequest> {
        let removed = self
            .levels
            .get_mut(&priority)
            .and_then(|level| level.requests.remove(index));
        if removed.is_some() {
            self.size -= 1;
        }
        removed
    }

    /// Remove every request whose queue deadline has elapsed
    ///
    /// Front-scans each level; with uniform level timeouts the front holds
    /// the earliest deadline, so the scan is O(expired count) amortised.
    /// Override-shortened deadlines sitting mid-queue are caught by the
    /// assembler when it walks candidates.
    pub fn expire(&mut self, now: Instant) -> Vec<InferenceRequest> {
        let mut expired = Vec::new();
        for level in self.levels.values_mut() {
            while level
                .requests
                .front()
                .is_some_and(|request| request.is_expired(now))
            {
                let request = level.requests.pop_front().expect("front checked");
                debug!(request_id = %request.id, "request expired in queue");
                expired.push(request);
            }
        }
        self.size -= expired.len();
        expired
    }

    /// Remove everything; used by shutdown to fail residual requests
    pub fn drain(&mut self) -> Vec<InferenceRequest> {
        let mut drained = Vec::with_capacity(self.size);
        for level in self.levels.values_mut() {
            drained.extend(level.requests.drain(..));
        }
        self.size = 0;
        drained
    }
}

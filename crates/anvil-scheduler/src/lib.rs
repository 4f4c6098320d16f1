//! # Anvil Scheduler
//!
//! Dynamic batching scheduler for inference serving.
//!
//! ## Overview
//!
//! The scheduler accepts per-request inference jobs, coalesces them into
//! model-friendly batches subject to shape and priority constraints, and
//! dispatches them to a pool of runner threads while preserving ordering,
//! latency, and fairness guarantees.
//!
//! ## Design Principles
//!
//! - **Multi-level queue**: per-priority FIFO levels with independent policies
//! - **Shape-aware assembly**: batches only combine requests whose constrained
//!   inputs (and shape-tensor contents) match
//! - **Preferred sizes**: batch growth steers toward the sizes the model runs
//!   most efficiently at, bounded by a configurable queue delay
//! - **Ordered completion**: an optional ticket barrier re-serializes responses
//!   to match dispatch order
//! - **Unique ownership**: a request is held by exactly one of the queue, a
//!   runner, or its completion callback

pub mod batch;
pub mod clock;
pub mod metrics;
pub mod ordering;
pub mod queue;
pub mod scheduler;
pub mod worker;

// Re-exports
pub use batch::{Assembly, BatchAssembler, BatchDecision};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use metrics::{MetricsSnapshot, SchedulerMetricsCollector};
pub use ordering::{CompletionOrderer, FinishedBatch};
pub use queue::{PriorityQueue, PushOutcome};
pub use scheduler::{Callbacks, DynamicBatchScheduler};

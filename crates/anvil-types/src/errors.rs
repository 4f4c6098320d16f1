//! Error types for the Anvil scheduler

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for scheduling operations
///
/// Every variant except `Internal` is terminal for the affected request.
/// The scheduler produces all of them itself apart from `ExecuteFailed`,
/// which is opaque and forwarded from the execution callable. Errors are
/// delivered to callers through the per-request completion callback; the
/// scheduler never unwinds across worker boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleError {
    /// Request priority is outside the configured level range
    #[error("Invalid priority level: {priority} (configured levels: {levels})")]
    InvalidPriority { priority: u32, levels: u32 },

    /// The target priority level is at capacity and rejects new work
    #[error("Queue is full: {message}")]
    QueueFull { message: String },

    /// The request was pushed out of a full level to make room for newer work
    #[error("Request displaced from queue: {message}")]
    QueueDisplaced { message: String },

    /// The request exceeded its queue timeout before dispatch
    #[error("Request timed out in queue: {message}")]
    TimedOut { message: String },

    /// A declared input shape is incompatible with the model configuration
    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    /// The scheduler is shutting down and drained this request
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// The execution callable reported a batch-level failure
    #[error("Execution failed: {message}")]
    ExecuteFailed { message: String },

    /// Internal invariant violation (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ScheduleError {
    /// Create an invalid-priority error
    pub fn invalid_priority(priority: u32, levels: u32) -> Self {
        Self::InvalidPriority { priority, levels }
    }

    /// Create a queue-full error
    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::QueueFull {
            message: message.into(),
        }
    }

    /// Create a queue-displaced error
    pub fn queue_displaced(message: impl Into<String>) -> Self {
        Self::QueueDisplaced {
            message: message.into(),
        }
    }

    /// Create a timed-out error
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::TimedOut {
            message: message.into(),
        }
    }

    /// Create a shape-mismatch error
    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    /// Create an execute-failed error
    pub fn execute_failed(message: impl Into<String>) -> Self {
        Self::ExecuteFailed {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is terminal for the affected request
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Internal { .. })
    }

    /// Check if this is a client error (caused by the request itself)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPriority { .. } | Self::ShapeMismatch { .. }
        )
    }

    /// Check if this error reflects scheduler load rather than the request
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::QueueDisplaced { .. } | Self::TimedOut { .. }
        )
    }
}

//! Configuration types for the Anvil scheduler

use crate::ScheduleError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Action taken when a priority level is at its depth limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowAction {
    /// Reject the incoming request
    RejectNew,
    /// Displace the oldest queued request to make room
    RejectOldest,
    /// Admit anyway; the depth limit is treated as a soft bound
    Delay,
}

/// Per-priority-level queue policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Maximum number of queued requests at this level; 0 means unbounded
    pub max_queue_size: usize,
    /// Queue timeout applied to every request at this level
    #[serde(with = "opt_duration_micros")]
    pub default_timeout: Option<Duration>,
    /// Whether a request-supplied timeout may shorten the level timeout
    pub allow_timeout_override: bool,
    /// Behavior when the level is full
    pub overflow_action: OverflowAction,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            default_timeout: None,
            allow_timeout_override: true,
            overflow_action: OverflowAction::RejectNew,
        }
    }
}

impl QueuePolicy {
    /// Effective timeout for a request with an optional override
    ///
    /// The override may only shorten the level timeout, and only when the
    /// policy allows overrides at all.
    pub fn effective_timeout(&self, request_timeout: Option<Duration>) -> Option<Duration> {
        let override_timeout = if self.allow_timeout_override {
            request_timeout
        } else {
            None
        };
        match (self.default_timeout, override_timeout) {
            (Some(level), Some(req)) => Some(level.min(req)),
            (Some(level), None) => Some(level),
            (None, req) => req,
        }
    }
}

/// Scheduler configuration
///
/// This is the subset of the model configuration the scheduler consumes,
/// parsed and validated by an external collaborator before construction.
/// All durations are microsecond-granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether batches may contain more than one request
    pub dynamic_batching_enabled: bool,
    /// Largest batch the model accepts
    pub max_batch_size: u32,
    /// Batch sizes the model runs most efficiently at
    pub preferred_batch_sizes: BTreeSet<u32>,
    /// Maximum additional wait to grow a batch toward a preferred size
    #[serde(with = "duration_micros")]
    pub max_queue_delay: Duration,
    /// Whether response publication order must match dispatch order
    pub preserve_ordering: bool,
    /// Inputs requiring equal shapes across a batch; `true` marks a shape
    /// tensor whose contents must match as well
    pub enforce_equal_shape_tensors: HashMap<String, bool>,
    /// Policy applied to levels without an explicit entry
    pub default_queue_policy: QueuePolicy,
    /// Number of priority levels; level 0 is the highest
    pub priority_levels: u32,
    /// Sparse per-level policy overrides
    pub per_level_queue_policy: HashMap<u32, QueuePolicy>,
    /// Number of runner threads
    pub runner_count: usize,
    /// Best-effort OS scheduling hint applied to each runner
    pub runner_nice: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dynamic_batching_enabled: true,
            max_batch_size: 8,
            preferred_batch_sizes: BTreeSet::new(),
            max_queue_delay: Duration::ZERO,
            preserve_ordering: false,
            enforce_equal_shape_tensors: HashMap::new(),
            default_queue_policy: QueuePolicy::default(),
            priority_levels: 1,
            per_level_queue_policy: HashMap::new(),
            runner_count: 1,
            runner_nice: 0,
        }
    }
}

impl SchedulerConfig {
    /// Validate internal consistency
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.priority_levels < 1 {
            return Err(ScheduleError::internal(
                "priority_levels must be at least 1",
            ));
        }
        if self.runner_count < 1 {
            return Err(ScheduleError::internal("runner_count must be at least 1"));
        }
        if self.max_batch_size < 1 {
            return Err(ScheduleError::internal("max_batch_size must be at least 1"));
        }
        if let Some(largest) = self.preferred_batch_sizes.iter().next_back() {
            if *largest > self.max_batch_size {
                return Err(ScheduleError::internal(format!(
                    "preferred batch size {} exceeds max_batch_size {}",
                    largest, self.max_batch_size
                )));
            }
        }
        if self.preferred_batch_sizes.contains(&0) {
            return Err(ScheduleError::internal(
                "preferred batch sizes must be positive",
            ));
        }
        for level in self.per_level_queue_policy.keys() {
            if *level >= self.priority_levels {
                return Err(ScheduleError::internal(format!(
                    "queue policy for level {} is outside the configured {} levels",
                    level, self.priority_levels
                )));
            }
        }
        Ok(())
    }

    /// Policy in effect for a given priority level
    pub fn policy_for_level(&self, level: u32) -> &QueuePolicy {
        self.per_level_queue_policy
            .get(&level)
            .unwrap_or(&self.default_queue_policy)
    }
}

/// Serialize `Duration` as integer microseconds
mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}

/// Serialize `Option<Duration>` as optional integer microseconds
mod opt_duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_micros() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let micros = Option::<u64>::deserialize(deserializer)?;
        Ok(micros.map(Duration::from_micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn preferred_sizes_must_fit_max() {
        let config = SchedulerConfig {
            max_batch_size: 4,
            preferred_batch_sizes: BTreeSet::from([2, 8]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_levels_must_be_in_range() {
        let config = SchedulerConfig {
            priority_levels: 2,
            per_level_queue_policy: HashMap::from([(3, QueuePolicy::default())]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn effective_timeout_takes_minimum() {
        let policy = QueuePolicy {
            default_timeout: Some(Duration::from_millis(10)),
            allow_timeout_override: true,
            ..Default::default()
        };
        assert_eq!(
            policy.effective_timeout(Some(Duration::from_millis(3))),
            Some(Duration::from_millis(3))
        );
        assert_eq!(
            policy.effective_timeout(Some(Duration::from_millis(30))),
            Some(Duration::from_millis(10))
        );
        assert_eq!(
            policy.effective_timeout(None),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn override_ignored_when_disallowed() {
        let policy = QueuePolicy {
            default_timeout: Some(Duration::from_millis(10)),
            allow_timeout_override: false,
            ..Default::default()
        };
        assert_eq!(
            policy.effective_timeout(Some(Duration::from_millis(1))),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn sparse_policy_lookup_falls_back_to_default() {
        let strict = QueuePolicy {
            max_queue_size: 1,
            ..Default::default()
        };
        let config = SchedulerConfig {
            priority_levels: 3,
            per_level_queue_policy: HashMap::from([(1, strict.clone())]),
            ..Default::default()
        };
        assert_eq!(config.policy_for_level(1), &strict);
        assert_eq!(config.policy_for_level(0), &config.default_queue_policy);
    }

    #[test]
    fn durations_round_trip_as_microseconds() {
        let config = SchedulerConfig {
            max_queue_delay: Duration::from_micros(10_000),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_queue_delay, Duration::from_micros(10_000));
    }
}

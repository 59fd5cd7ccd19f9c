use crate::{
    error::Error,
    types::{Priority, PRIORITY_LEVELS},
};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

/// Batch-size and wait-time thresholds for one priority level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchPolicy {
    /// Maximum number of events submitted to the sink in one call.
    pub max_batch_size: usize,
    /// Maximum time a queued event waits before a timer-driven flush (ms).
    /// Zero flushes immediately instead of arming a timer.
    #[serde(default)]
    pub max_wait_ms: u64,
}

impl BatchPolicy {
    /// Built-in thresholds for a priority level.
    pub fn builtin(priority: Priority) -> Self {
        match priority {
            Priority::Critical => Self {
                max_batch_size: 1,
                max_wait_ms: 0,
            },
            Priority::High => Self {
                max_batch_size: 10,
                max_wait_ms: 5_000,
            },
            Priority::Medium => Self {
                max_batch_size: 50,
                max_wait_ms: 15_000,
            },
            Priority::Low => Self {
                max_batch_size: 100,
                max_wait_ms: 30_000,
            },
            Priority::Info => Self {
                max_batch_size: 100,
                max_wait_ms: 30_000,
            },
        }
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Pipeline configuration.
///
/// Deserializes from kebab-case YAML; every field falls back to the
/// documented default when omitted, so an empty document is a valid
/// configuration.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineConfig {
    /// Per-priority threshold overrides. Priorities absent from the map use
    /// [`BatchPolicy::builtin`].
    pub batch: BTreeMap<Priority, BatchPolicy>,
    /// When disabled, no size triggers fire and no timers are armed; events
    /// leave the queues only through manual `flush` or `shutdown`.
    pub enable_auto_flush: bool,
    pub enable_deduplication: bool,
    /// Window within which logically-identical events coalesce (ms).
    pub deduplication_window_ms: u64,
    /// Failed events are dropped after this many delivery attempts.
    pub max_retry_attempts: u32,
    /// Fixed delay before a failed event becomes due for resubmission (ms).
    /// Also the retry ticker interval.
    pub retry_delay_ms: u64,
    pub enable_backpressure: bool,
    /// Global queued-event ceiling; above it only CRITICAL events are
    /// admitted.
    pub max_queue_size: usize,
    /// Flush CRITICAL and HIGH queues at ingestion instead of waiting for a
    /// size or timer trigger.
    pub process_high_priority_immediately: bool,
    /// Default priority per event kind; unlisted kinds fall back to INFO.
    pub default_priorities: BTreeMap<String, Priority>,
    /// Upper bound on the final drain performed by `shutdown` (ms).
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch: BTreeMap::new(),
            enable_auto_flush: true,
            enable_deduplication: true,
            deduplication_window_ms: 60_000,
            max_retry_attempts: 3,
            retry_delay_ms: 60_000,
            enable_backpressure: true,
            max_queue_size: 10_000,
            process_high_priority_immediately: true,
            default_priorities: BTreeMap::new(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    /// Effective thresholds for a priority level.
    pub fn policy(&self, priority: Priority) -> BatchPolicy {
        self.batch
            .get(&priority)
            .copied()
            .unwrap_or_else(|| BatchPolicy::builtin(priority))
    }

    pub(crate) fn policies(&self) -> [BatchPolicy; PRIORITY_LEVELS] {
        Priority::ALL.map(|p| self.policy(p))
    }

    /// Default priority for an event kind.
    pub fn default_priority_for(&self, kind: &str) -> Priority {
        self.default_priorities
            .get(kind)
            .copied()
            .unwrap_or(Priority::Info)
    }

    pub fn deduplication_window(&self) -> Duration {
        Duration::from_millis(self.deduplication_window_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Semantic checks that deserialization cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        for priority in Priority::ALL {
            if self.policy(priority).max_batch_size == 0 {
                return Err(Error::InvalidBatchSize(priority));
            }
        }
        if self.enable_backpressure && self.max_queue_size == 0 {
            return Err(Error::InvalidQueueCapacity(self.max_queue_size));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::InvalidRetryAttempts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_is_the_default_config() {
        let cfg: PipelineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn critical_builtin_is_synchronous() {
        let cfg = PipelineConfig::default();
        let policy = cfg.policy(Priority::Critical);
        assert_eq!(policy.max_batch_size, 1);
        assert_eq!(policy.max_wait(), Duration::ZERO);
    }

    #[test]
    fn yaml_overrides_merge_with_builtins() {
        let cfg: PipelineConfig = serde_yaml::from_str(
            r#"
batch:
  info:
    max-batch-size: 100
    max-wait-ms: 30000
  high:
    max-batch-size: 5
    max-wait-ms: 1000
max-retry-attempts: 5
retry-delay-ms: 1000
default-priorities:
  payment.declined: critical
  auth.login: medium
"#,
        )
        .unwrap();

        assert_eq!(cfg.policy(Priority::High).max_batch_size, 5);
        assert_eq!(cfg.policy(Priority::Info).max_wait_ms, 30_000);
        // Unlisted priorities keep the builtin thresholds
        assert_eq!(
            cfg.policy(Priority::Critical),
            BatchPolicy::builtin(Priority::Critical)
        );
        assert_eq!(cfg.max_retry_attempts, 5);
        assert_eq!(
            cfg.default_priority_for("payment.declined"),
            Priority::Critical
        );
        assert_eq!(cfg.default_priority_for("auth.login"), Priority::Medium);
        assert_eq!(cfg.default_priority_for("page.view"), Priority::Info);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cfg: PipelineConfig = serde_yaml::from_str(
            r#"
batch:
  low:
    max-batch-size: 0
"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(Error::InvalidBatchSize(Priority::Low))
        ));
    }

    #[test]
    fn zero_queue_ceiling_is_rejected_with_backpressure() {
        let cfg: PipelineConfig = serde_yaml::from_str("max-queue-size: 0").unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(Error::InvalidQueueCapacity(0))
        ));

        let cfg: PipelineConfig =
            serde_yaml::from_str("max-queue-size: 0\nenable-backpressure: false").unwrap();
        cfg.validate().unwrap();
    }
}

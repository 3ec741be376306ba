use std::collections::HashSet;
use std::time::Duration;

use crate::extract::MAX_CHAR_NUM;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Partitions per channel; also the number of workers per stage.
    pub partitions: usize,
    /// Queue depth of every partition.
    pub channel_capacity: usize,
    /// Slots in the extraction pool.
    pub extract_workers: usize,
    pub allowed_categories: HashSet<String>,
    /// Documents are truncated to this many characters before extraction.
    pub max_chars: usize,
    pub extract_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            channel_capacity: 1024,
            extract_workers: 1,
            allowed_categories: HashSet::from(["PERSON".to_string()]),
            max_chars: MAX_CHAR_NUM,
            extract_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Clamp knobs that must be at least one.
    pub fn normalized(mut self) -> Self {
        self.partitions = self.partitions.max(1);
        self.channel_capacity = self.channel_capacity.max(1);
        self.extract_workers = self.extract_workers.max(1);
        self
    }
}

/// Redelivery of retryable failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// 0 retries forever. A bounded policy stops the partition worker with the
    /// last error once the limit is reached; the message is never acknowledged.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 0, initial_backoff: Duration::from_millis(50), max_backoff: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`; doubles each time up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << shift).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy { max_attempts: 3, initial_backoff: Duration::from_millis(100), max_backoff: Duration::from_millis(350) };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn attempt_limit() {
        let retry = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        assert!(retry.allows_retry(1));
        assert!(retry.allows_retry(2));
        assert!(!retry.allows_retry(3));
        let forever = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert!(forever.allows_retry(u32::MAX));
    }

    #[test]
    fn default_never_gives_up() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_attempts, 0);
        assert!(retry.allows_retry(1_000_000));
        assert_eq!(retry.backoff(1_000_000), retry.max_backoff);
    }

    #[test]
    fn normalized_clamps_zeroes() {
        let config = PipelineConfig { partitions: 0, channel_capacity: 0, extract_workers: 0, ..PipelineConfig::default() }.normalized();
        assert_eq!((config.partitions, config.channel_capacity, config.extract_workers), (1, 1, 1));
    }
}

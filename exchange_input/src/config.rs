//! Per-channel settings, derived from the CLI [`PartitionRequestConfig`].

use std::{num::NonZeroUsize, time::Duration};

use exchange_clap_blocks::partition_request::PartitionRequestConfig;

use crate::backoff::{BackoffConfig, RetryLimit};

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum ConfigError {
    #[error("initial backoff {initial:?} must not exceed max backoff {max:?}")]
    InitialBackoffExceedsMax { initial: Duration, max: Duration },
}

/// Settings shared by every input channel of a gate.
///
/// These are carried over unchanged when an unknown channel graduates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub backoff: BackoffConfig,
    pub retry_limit: RetryLimit,
    /// Capacity of the inbound queue of remote channels.
    pub queue_capacity: NonZeroUsize,
}

impl ChannelConfig {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            backoff,
            ..Default::default()
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: RetryLimit) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: NonZeroUsize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            retry_limit: RetryLimit::default(),
            queue_capacity: NonZeroUsize::new(64).expect("64 is non-zero"),
        }
    }
}

impl TryFrom<&PartitionRequestConfig> for ChannelConfig {
    type Error = ConfigError;

    fn try_from(config: &PartitionRequestConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            backoff: BackoffConfig::new(config.initial_backoff, config.max_backoff)?,
            retry_limit: RetryLimit {
                max_attempts: config.max_attempts,
                deadline: config.retry_deadline,
            },
            queue_capacity: config.queue_capacity,
        })
    }
}

//! Retry delays for partition requests.
//!
//! [`BackoffConfig::next_delay`] is a pure function of the attempt number. [`BackoffState`] layers
//! the per-channel bookkeeping and the [`RetryLimit`] on top of it; the caller passes in the
//! current time and schedules the returned delay itself.

use std::{num::NonZeroU32, time::Duration};

use iox_time::Time;

use crate::config::ConfigError;

/// Exponential backoff between `initial` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    initial: Duration,
    max: Duration,
}

impl BackoffConfig {
    /// Create a backoff config, validating that `initial` does not exceed `max`.
    pub fn new(initial: Duration, max: Duration) -> Result<Self, ConfigError> {
        if initial > max {
            return Err(ConfigError::InitialBackoffExceedsMax { initial, max });
        }
        Ok(Self { initial, max })
    }

    /// A config under which the first failed request is terminal.
    pub const fn disabled() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Whether failed requests are retried at all.
    pub fn is_disabled(&self) -> bool {
        self.initial.is_zero()
    }

    /// The delay to wait before retrying after the failure numbered `attempt` (starting at 0).
    ///
    /// The delay doubles with every attempt and is capped at `max`. Once the previous attempt
    /// already waited `max`, `None` is returned: the retry ceiling of the policy is reached.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.is_disabled() {
            return None;
        }
        if attempt > 0 && self.capped_delay(attempt - 1) >= self.max {
            return None;
        }
        Some(self.capped_delay(attempt))
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        self.initial
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

/// Additional bounds on how long a partition request is retried.
///
/// With neither bound set, retrying ends when [`BackoffConfig::next_delay`] does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryLimit {
    /// Maximum number of failed requests before giving up.
    pub max_attempts: Option<NonZeroU32>,
    /// Maximum time since the first failed request before giving up.
    pub deadline: Option<Duration>,
}

/// Retry bookkeeping for the partition requests of one channel.
#[derive(Debug, Clone, Copy)]
pub struct BackoffState {
    config: BackoffConfig,
    limit: RetryLimit,
    attempts: u32,
    current: Duration,
    first_failure: Option<Time>,
}

impl BackoffState {
    pub fn new(config: BackoffConfig, limit: RetryLimit) -> Self {
        Self {
            config,
            limit,
            attempts: 0,
            current: Duration::ZERO,
            first_failure: None,
        }
    }

    pub fn config(&self) -> BackoffConfig {
        self.config
    }

    /// Number of failed requests registered since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The delay handed out for the most recent failure, zero if there was none.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Register a failed request observed at `now`.
    ///
    /// Returns the delay to wait before the next request, or `None` if the retry ceiling is
    /// exceeded and the failure has to be escalated.
    pub fn on_failure(&mut self, now: Time) -> Option<Duration> {
        let attempt = self.attempts;
        self.attempts = self.attempts.saturating_add(1);

        if let Some(max_attempts) = self.limit.max_attempts {
            if self.attempts >= max_attempts.get() {
                return None;
            }
        }

        let first_failure = *self.first_failure.get_or_insert(now);
        if let Some(deadline) = self.limit.deadline {
            let elapsed = now
                .checked_duration_since(first_failure)
                .unwrap_or_default();
            if elapsed >= deadline {
                return None;
            }
        }

        let delay = self.config.next_delay(attempt)?;
        self.current = delay;
        Some(delay)
    }

    /// Forget all failures, e.g. after a request succeeded.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = Duration::ZERO;
        self.first_failure = None;
    }
}

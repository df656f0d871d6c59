//! Config for partition requests issued by input channels.

use std::{
    num::{NonZeroU32, NonZeroUsize},
    time::Duration,
};

/// CLI config for how input channels request subpartitions from their producers.
///
/// A request for a partition that has not been produced yet is retried with an exponential
/// backoff, starting at `initial_backoff` and doubling up to `max_backoff`. Retrying stops once the
/// backoff reached its maximum, or earlier when `max_attempts` or `retry_deadline` is set.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct PartitionRequestConfig {
    /// Delay before the first retry of a failed partition request.
    ///
    /// Set both this and `--partition-request-max-backoff` to `0s` to disable retries, in which
    /// case the first failed request fails the consuming task.
    #[clap(
        long = "partition-request-initial-backoff",
        env = "EXCHANGE_PARTITION_REQUEST_INITIAL_BACKOFF",
        default_value = "100ms",
        value_parser = humantime::parse_duration,
        action
    )]
    pub initial_backoff: Duration,

    /// Upper bound of the delay between two partition request retries.
    #[clap(
        long = "partition-request-max-backoff",
        env = "EXCHANGE_PARTITION_REQUEST_MAX_BACKOFF",
        default_value = "10s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub max_backoff: Duration,

    /// Give up after this many failed requests for the same partition.
    #[clap(
        long = "partition-request-max-attempts",
        env = "EXCHANGE_PARTITION_REQUEST_MAX_ATTEMPTS",
        action
    )]
    pub max_attempts: Option<NonZeroU32>,

    /// Give up once this much time has passed since the first failed request.
    ///
    /// Enter as a human-readable time, e.g., "30s".
    #[clap(
        long = "partition-request-retry-deadline",
        env = "EXCHANGE_PARTITION_REQUEST_RETRY_DEADLINE",
        value_parser = humantime::parse_duration,
        action
    )]
    pub retry_deadline: Option<Duration>,

    /// Number of buffers a remote input channel queues before the producer is throttled.
    #[clap(
        long = "input-channel-queue-capacity",
        env = "EXCHANGE_INPUT_CHANNEL_QUEUE_CAPACITY",
        default_value = "64",
        action
    )]
    pub queue_capacity: NonZeroUsize,
}

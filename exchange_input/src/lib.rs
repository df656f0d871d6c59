//! Consumer side of a data exchange: the input channels through which a task reads the
//! subpartitions produced by its upstream tasks.
//!
//! # Channels
//!
//! Every producer feeding a consuming task is read through one [`InputChannel`]. Which variant
//! that is depends on where the producer runs:
//!
//! - [`UnknownInputChannel`] stands in while the location of the producer is not known yet. It
//!   never performs I/O and never reports itself as released.
//! - [`LocalInputChannel`] reads a subpartition straight out of the in-process
//!   [`PartitionManager`].
//! - [`RemoteInputChannel`] reads a subpartition over a connection obtained from the
//!   [`ConnectionManager`], queueing the buffers delivered by the network.
//!
//! Once a producer location is known, the placeholder is *graduated* into a local or remote
//! channel that keeps its [`ChannelIndex`] and [`ResultPartitionId`]. The [`SingleInputGate`] that
//! owns the channels performs that swap and fans in their "data available" notifications.
//!
//! # Retries
//!
//! Requests for partitions that have not been produced yet are retried with the exponential
//! [`BackoffConfig`] until the configured [`RetryLimit`] is reached, at which point the failure
//! surfaces as [`InputChannelError::PartitionNotFound`].
//!
//! [`ChannelIndex`]: exchange_id::ChannelIndex
//! [`ResultPartitionId`]: exchange_id::ResultPartitionId

pub mod backoff;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod gate;
pub mod partition;
pub mod testing;

pub use backoff::{BackoffConfig, BackoffState, RetryLimit};
pub use buffer::{Buffer, BufferAndAvailability, BufferKind, BufferPool};
pub use channel::{
    ChannelIdentity, ChannelKind, ChannelResources, InputChannel, local::LocalInputChannel,
    remote::RemoteInputChannel, unknown::UnknownInputChannel,
};
pub use config::ChannelConfig;
pub use connection::{ConnectionError, ConnectionManager, PartitionRequestClient};
pub use error::{GateError, InputChannelError, Result};
pub use event::{TaskEvent, TaskEventDispatcher, TaskEventPublisher};
pub use gate::{ChannelOwner, ProducerLocation, SingleInputGate};
pub use partition::{PartitionManager, ResultPartition, ResultPartitionManager};

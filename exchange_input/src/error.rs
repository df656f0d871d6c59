use exchange_id::{ChannelIndex, ResultPartitionId, SubpartitionIndex};

use crate::connection::ConnectionError;

pub type Result<T, E = InputChannelError> = std::result::Result<T, E>;

/// Failures surfaced by input channels to the consuming task.
///
/// Transient "not produced yet" conditions are retried inside the channels and only show up here
/// once the retry ceiling was exceeded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InputChannelError {
    #[error(
        "partition {partition_id} not found for input channel {channel_index} \
        after {attempts} request attempts"
    )]
    PartitionNotFound {
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
        attempts: u32,
    },

    #[error("cannot {operation} on unresolved input channel {channel_index} ({partition_id})")]
    Unresolved {
        operation: &'static str,
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
    },

    #[error("input channel {channel_index} ({partition_id}) has been released")]
    Released {
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
    },

    #[error(
        "cannot {operation} on input channel {channel_index} ({partition_id}) \
        before requesting a subpartition"
    )]
    NotRequested {
        operation: &'static str,
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
    },

    #[error("subpartition {subpartition} does not exist in partition {partition_id}")]
    SubpartitionOutOfRange {
        partition_id: ResultPartitionId,
        subpartition: SubpartitionIndex,
    },

    #[error(
        "buffer reordering on input channel {channel_index} ({partition_id}): \
        expected sequence number {expected} but received {actual}"
    )]
    BufferReordering {
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
        expected: u32,
        actual: u32,
    },

    #[error(
        "producer of partition {partition_id} overran the inbound queue of input channel \
        {channel_index} (capacity {capacity})"
    )]
    QueueOverflow {
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
        capacity: usize,
    },

    #[error(
        "partition {partition_id} was released by its producer before input channel \
        {channel_index} consumed it"
    )]
    PartitionReleased {
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
    },

    #[error("producer of partition {partition_id} could not be found to publish a task event")]
    ProducerNotFound { partition_id: ResultPartitionId },

    #[error("failed to serialize task event: {0}")]
    EventSerialization(String),

    #[error("connection error on input channel {channel_index} ({partition_id}): {source}")]
    Connection {
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
        #[source]
        source: ConnectionError,
    },
}

/// Misuse of a [`SingleInputGate`](crate::gate::SingleInputGate) by its owner.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("channel index {channel_index} out of range for gate with {num_channels} channels")]
    IndexOutOfRange {
        channel_index: ChannelIndex,
        num_channels: usize,
    },

    #[error("input channel with index {channel_index} placed at position {position}")]
    PositionMismatch {
        channel_index: ChannelIndex,
        position: usize,
    },

    #[error(
        "channel for {actual_partition} at index {actual_index} cannot replace \
        the channel for {expected_partition} at index {expected_index}"
    )]
    IdentityMismatch {
        expected_index: ChannelIndex,
        expected_partition: ResultPartitionId,
        actual_index: ChannelIndex,
        actual_partition: ResultPartitionId,
    },

    #[error("input channel {channel_index} ({partition_id}) has already been resolved")]
    AlreadyResolved {
        partition_id: ResultPartitionId,
        channel_index: ChannelIndex,
    },

    #[error("gate has no input channel for partition {0}")]
    UnknownPartition(ResultPartitionId),

    #[error(transparent)]
    Channel(#[from] InputChannelError),
}

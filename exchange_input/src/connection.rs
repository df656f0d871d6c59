//! Interfaces of the network layer used by [`RemoteInputChannel`]s.
//!
//! The transport itself lives outside this crate. Responses to requests are not returned from
//! these calls; the client delivers them asynchronously through the callbacks of the channel
//! ([`RemoteInputChannel::on_buffer`], [`RemoteInputChannel::on_failed_partition_request`] and
//! [`RemoteInputChannel::on_error`]), typically from an I/O thread.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use exchange_id::{ConnectionId, InputChannelId, ResultPartitionId, SubpartitionIndex};

use crate::channel::remote::RemoteInputChannel;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {connection_id}: {message}")]
    Connect {
        connection_id: ConnectionId,
        message: Arc<str>,
    },

    #[error("connection to {connection_id} closed")]
    Closed { connection_id: ConnectionId },

    #[error("remote producer reported an error: {0}")]
    Remote(Arc<str>),
}

/// Hands out request clients for producer connections.
#[async_trait]
pub trait ConnectionManager: Debug + Send + Sync + 'static {
    /// Return a client for the connection identified by `connection_id`, establishing the
    /// connection if needed. Clients may be shared between channels.
    async fn create_request_client(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn PartitionRequestClient>, ConnectionError>;

    /// Drop connections for `connection_id` that no channel uses any more.
    fn close_open_channel_connections(&self, connection_id: &ConnectionId);
}

/// Client side of a connection to a producer.
#[async_trait]
pub trait PartitionRequestClient: Debug + Send + Sync + 'static {
    /// Ask the producer to stream `subpartition` of `partition_id` to `channel`.
    async fn request_subpartition(
        &self,
        partition_id: &ResultPartitionId,
        subpartition: SubpartitionIndex,
        channel: Arc<RemoteInputChannel>,
    ) -> Result<(), ConnectionError>;

    /// Send a serialized task event to the producer of `partition_id`.
    async fn send_task_event(
        &self,
        partition_id: &ResultPartitionId,
        event: Bytes,
        channel: Arc<RemoteInputChannel>,
    ) -> Result<(), ConnectionError>;

    /// Tell the producer that the channel has room for buffers again.
    fn resume_consumption(&self, channel_id: InputChannelId);

    /// Stop serving the channel. The connection may stay open for other channels.
    fn close(&self, channel_id: InputChannelId);
}

use std::{fmt::Display, sync::Arc};

use exchange_id::{ConnectionId, SubpartitionIndex};
use observability_deps::tracing::debug;

use crate::{
    buffer::BufferAndAvailability,
    channel::{
        ChannelIdentity, ChannelResources, local::LocalInputChannel, remote::RemoteInputChannel,
    },
    config::ChannelConfig,
    error::{InputChannelError, Result},
    event::TaskEvent,
};

/// Placeholder for a producer whose location is not known yet.
///
/// It holds everything needed to build the concrete channel once the location is known, and
/// performs no I/O itself. Requests and task events are ignored; polling for data or resuming is
/// an error. It never reports itself as released, so an owner cannot consider an input finished
/// that has not even been located.
#[derive(Debug)]
pub struct UnknownInputChannel {
    identity: ChannelIdentity,
    config: ChannelConfig,
    resources: ChannelResources,
}

impl UnknownInputChannel {
    pub fn new(
        identity: ChannelIdentity,
        config: ChannelConfig,
        resources: ChannelResources,
    ) -> Self {
        Self {
            identity,
            config,
            resources,
        }
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    /// Build the channel for a producer running in this process.
    pub fn to_local(&self) -> Arc<LocalInputChannel> {
        debug!(
            channel_index = %self.identity.channel_index(),
            channel = %self,
            "graduating unknown input channel to local"
        );
        Arc::new(LocalInputChannel::new(
            self.identity.clone(),
            self.config,
            &self.resources,
        ))
    }

    /// Build the channel for a producer reachable through `connection_id`.
    pub fn to_remote(&self, connection_id: ConnectionId) -> Arc<RemoteInputChannel> {
        debug!(
            channel_index = %self.identity.channel_index(),
            channel = %self,
            %connection_id,
            "graduating unknown input channel to remote"
        );
        Arc::new(RemoteInputChannel::new(
            self.identity.clone(),
            connection_id,
            self.config,
            &self.resources,
        ))
    }

    pub fn request_subpartition(&self, _subpartition: SubpartitionIndex) -> Result<()> {
        Ok(())
    }

    pub fn get_next_buffer(&self) -> Result<Option<BufferAndAvailability>> {
        Err(self.unresolved("poll for buffers"))
    }

    pub fn resume_consumption(&self) -> Result<()> {
        Err(self.unresolved("resume consumption"))
    }

    pub fn send_task_event(&self, _event: &TaskEvent) -> Result<()> {
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        false
    }

    pub fn release_all_resources(&self) {}

    fn unresolved(&self, operation: &'static str) -> InputChannelError {
        debug!(channel = %self, operation, "operation on unresolved input channel");
        InputChannelError::Unresolved {
            operation,
            partition_id: self.identity.partition_id(),
            channel_index: self.identity.channel_index(),
        }
    }
}

impl Display for UnknownInputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnknownInputChannel [{}]", self.identity.partition_id())
    }
}

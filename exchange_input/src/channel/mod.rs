//! The input channel variants and the dispatch over them.

use std::sync::Arc;

use exchange_id::{ChannelIndex, ResultPartitionId, SubpartitionIndex};
use iox_time::TimeProvider;
use parking_lot::Mutex;

use crate::{
    buffer::BufferAndAvailability,
    connection::ConnectionManager,
    error::{InputChannelError, Result},
    event::{TaskEvent, TaskEventPublisher},
    gate::ChannelOwner,
    partition::{BufferAvailabilityListener, PartitionManager},
};

pub mod local;
pub mod remote;
pub mod unknown;

use self::{local::LocalInputChannel, remote::RemoteInputChannel, unknown::UnknownInputChannel};

/// Who a channel belongs to and which partition it reads. Never changes across graduation.
#[derive(Debug, Clone)]
pub struct ChannelIdentity {
    channel_index: ChannelIndex,
    partition_id: ResultPartitionId,
    owner: Arc<dyn ChannelOwner>,
}

impl ChannelIdentity {
    pub fn new(
        channel_index: ChannelIndex,
        partition_id: ResultPartitionId,
        owner: Arc<dyn ChannelOwner>,
    ) -> Self {
        Self {
            channel_index,
            partition_id,
            owner,
        }
    }

    pub fn channel_index(&self) -> ChannelIndex {
        self.channel_index
    }

    pub fn partition_id(&self) -> ResultPartitionId {
        self.partition_id
    }

    pub fn owner(&self) -> &Arc<dyn ChannelOwner> {
        &self.owner
    }

    /// Tell the owner that this channel has data, or an error, to poll.
    pub(crate) fn notify_owner(&self) {
        self.owner.notify_channel_non_empty(self.channel_index);
    }

    pub(crate) fn availability_listener(&self) -> Arc<dyn BufferAvailabilityListener> {
        Arc::new(OwnerListener {
            identity: self.clone(),
        })
    }
}

/// Forwards subpartition availability to the channel owner.
#[derive(Debug)]
struct OwnerListener {
    identity: ChannelIdentity,
}

impl BufferAvailabilityListener for OwnerListener {
    fn notify_data_available(&self) {
        self.identity.notify_owner();
    }
}

/// The collaborators a channel may need once it graduates.
#[derive(Debug, Clone)]
pub struct ChannelResources {
    pub partition_manager: Arc<dyn PartitionManager>,
    pub task_event_publisher: Arc<dyn TaskEventPublisher>,
    pub connection_manager: Arc<dyn ConnectionManager>,
    pub time_provider: Arc<dyn TimeProvider>,
}

impl ChannelResources {
    pub fn new(
        partition_manager: Arc<dyn PartitionManager>,
        task_event_publisher: Arc<dyn TaskEventPublisher>,
        connection_manager: Arc<dyn ConnectionManager>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            partition_manager,
            task_event_publisher,
            connection_manager,
            time_provider,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Unknown,
    Local,
    Remote,
}

/// One input of a consuming task, in whichever form its producer location allows.
#[derive(Debug, Clone)]
pub enum InputChannel {
    Unknown(Arc<UnknownInputChannel>),
    Local(Arc<LocalInputChannel>),
    Remote(Arc<RemoteInputChannel>),
}

impl InputChannel {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Unknown(_) => ChannelKind::Unknown,
            Self::Local(_) => ChannelKind::Local,
            Self::Remote(_) => ChannelKind::Remote,
        }
    }

    pub fn identity(&self) -> &ChannelIdentity {
        match self {
            Self::Unknown(c) => c.identity(),
            Self::Local(c) => c.identity(),
            Self::Remote(c) => c.identity(),
        }
    }

    pub fn channel_index(&self) -> ChannelIndex {
        self.identity().channel_index()
    }

    pub fn partition_id(&self) -> ResultPartitionId {
        self.identity().partition_id()
    }

    /// Start reading `subpartition` from the producer. Calling this again is a no-op.
    pub async fn request_subpartition(&self, subpartition: SubpartitionIndex) -> Result<()> {
        match self {
            Self::Unknown(c) => c.request_subpartition(subpartition),
            Self::Local(c) => c.request_subpartition(subpartition).await,
            Self::Remote(c) => c.request_subpartition(subpartition).await,
        }
    }

    /// Take the next buffer if one is available, without waiting.
    pub fn get_next_buffer(&self) -> Result<Option<BufferAndAvailability>> {
        match self {
            Self::Unknown(c) => c.get_next_buffer(),
            Self::Local(c) => c.get_next_buffer(),
            Self::Remote(c) => c.get_next_buffer(),
        }
    }

    pub fn resume_consumption(&self) -> Result<()> {
        match self {
            Self::Unknown(c) => c.resume_consumption(),
            Self::Local(c) => c.resume_consumption(),
            Self::Remote(c) => c.resume_consumption(),
        }
    }

    pub async fn send_task_event(&self, event: &TaskEvent) -> Result<()> {
        match self {
            Self::Unknown(c) => c.send_task_event(event),
            Self::Local(c) => c.send_task_event(event),
            Self::Remote(c) => c.send_task_event(event).await,
        }
    }

    pub fn is_released(&self) -> bool {
        match self {
            Self::Unknown(c) => c.is_released(),
            Self::Local(c) => c.is_released(),
            Self::Remote(c) => c.is_released(),
        }
    }

    pub fn release_all_resources(&self) {
        match self {
            Self::Unknown(c) => c.release_all_resources(),
            Self::Local(c) => c.release_all_resources(),
            Self::Remote(c) => c.release_all_resources(),
        }
    }
}

impl From<Arc<UnknownInputChannel>> for InputChannel {
    fn from(channel: Arc<UnknownInputChannel>) -> Self {
        Self::Unknown(channel)
    }
}

impl From<Arc<LocalInputChannel>> for InputChannel {
    fn from(channel: Arc<LocalInputChannel>) -> Self {
        Self::Local(channel)
    }
}

impl From<Arc<RemoteInputChannel>> for InputChannel {
    fn from(channel: Arc<RemoteInputChannel>) -> Self {
        Self::Remote(channel)
    }
}

/// The first fatal error hit by a channel outside of a consumer call.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(Mutex<Option<InputChannelError>>);

impl ErrorSlot {
    pub(crate) fn check(&self) -> Result<()> {
        match &*self.0.lock() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Store `error` unless an earlier one is stored. Returns whether it was stored.
    pub(crate) fn set(&self, error: InputChannelError) -> bool {
        let mut slot = self.0.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(error);
        true
    }
}

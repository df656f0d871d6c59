//! The owner of the input channels of one logical input of a task.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use exchange_id::{ChannelIndex, ConnectionId, ResultPartitionId, SubpartitionIndex};
use futures::future::try_join_all;
use hashbrown::HashSet;
use observability_deps::tracing::{debug, info};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::{
    buffer::BufferAndAvailability,
    channel::{
        ChannelIdentity, ChannelResources, InputChannel, remote::RemoteInputChannel,
        unknown::UnknownInputChannel,
    },
    config::ChannelConfig,
    error::{GateError, InputChannelError},
    event::TaskEvent,
};

/// Receives the "data available" notifications of the channels it owns.
pub trait ChannelOwner: Debug + Send + Sync + 'static {
    /// The channel at `channel_index` went from empty to non-empty, or failed.
    ///
    /// Called from arbitrary threads, possibly while the channel holds internal locks. It must
    /// not call back into the channel.
    fn notify_channel_non_empty(&self, channel_index: ChannelIndex);
}

/// Where the producer of a partition turned out to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerLocation {
    Local,
    Remote(ConnectionId),
}

/// Channels with pending data, in notification order.
#[derive(Debug, Default)]
struct ChannelNotifier {
    pending: Mutex<PendingChannels>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct PendingChannels {
    queue: VecDeque<ChannelIndex>,
    queued: HashSet<ChannelIndex>,
}

impl ChannelNotifier {
    fn push(&self, channel_index: ChannelIndex) {
        {
            let mut pending = self.pending.lock();
            if pending.queued.insert(channel_index) {
                pending.queue.push_back(channel_index);
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ChannelIndex> {
        let mut pending = self.pending.lock();
        let channel_index = pending.queue.pop_front()?;
        pending.queued.remove(&channel_index);
        Some(channel_index)
    }

    fn has_pending(&self) -> bool {
        !self.pending.lock().queue.is_empty()
    }
}

impl ChannelOwner for ChannelNotifier {
    fn notify_channel_non_empty(&self, channel_index: ChannelIndex) {
        self.push(channel_index);
    }
}

/// Holds one channel per producer of an input and reads them as a single stream.
///
/// Channels start out as [`UnknownInputChannel`]s where the producer location is not known, and
/// are swapped for their graduated form by [`update_input_channel`](Self::update_input_channel).
#[derive(Debug)]
pub struct SingleInputGate {
    subpartition: SubpartitionIndex,
    config: ChannelConfig,
    resources: ChannelResources,
    channels: RwLock<Vec<InputChannel>>,
    notifier: Arc<ChannelNotifier>,
    requested: AtomicBool,
    released: AtomicBool,
}

impl SingleInputGate {
    /// A gate without channels, to be filled by [`set_input_channels`](Self::set_input_channels).
    pub fn new(
        subpartition: SubpartitionIndex,
        config: ChannelConfig,
        resources: ChannelResources,
    ) -> Self {
        Self {
            subpartition,
            config,
            resources,
            channels: RwLock::new(Vec::new()),
            notifier: Arc::new(ChannelNotifier::default()),
            requested: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// A gate with an unresolved channel for each of `partitions`, indexed in iteration order.
    pub fn with_unknown_channels(
        partitions: impl IntoIterator<Item = ResultPartitionId>,
        subpartition: SubpartitionIndex,
        config: ChannelConfig,
        resources: ChannelResources,
    ) -> Self {
        let gate = Self::new(subpartition, config, resources);
        let channels = partitions
            .into_iter()
            .enumerate()
            .map(|(i, partition_id)| {
                let identity =
                    ChannelIdentity::new(ChannelIndex::new(i), partition_id, gate.owner());
                InputChannel::Unknown(Arc::new(UnknownInputChannel::new(
                    identity,
                    gate.config,
                    gate.resources.clone(),
                )))
            })
            .collect();
        *gate.channels.write() = channels;
        gate
    }

    /// The owner to build channel identities for this gate with.
    pub fn owner(&self) -> Arc<dyn ChannelOwner> {
        Arc::clone(&self.notifier) as _
    }

    pub fn subpartition(&self) -> SubpartitionIndex {
        self.subpartition
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    pub fn resources(&self) -> &ChannelResources {
        &self.resources
    }

    /// Replace all channels. Each channel must sit at the position of its channel index.
    pub fn set_input_channels(&self, channels: Vec<InputChannel>) -> Result<(), GateError> {
        if let Some((position, channel)) = channels
            .iter()
            .enumerate()
            .find(|(position, channel)| channel.channel_index().get() != *position)
        {
            return Err(GateError::PositionMismatch {
                channel_index: channel.channel_index(),
                position,
            });
        }
        *self.channels.write() = channels;
        Ok(())
    }

    pub fn num_channels(&self) -> usize {
        self.channels.read().len()
    }

    pub fn channel(&self, channel_index: ChannelIndex) -> Option<InputChannel> {
        self.channels.read().get(channel_index.get()).cloned()
    }

    pub fn channels(&self) -> Vec<InputChannel> {
        self.channels.read().clone()
    }

    /// Swap the channel at `channel_index` for `channel`, which must have the same identity.
    /// Returns the replaced channel.
    pub fn replace_channel(
        &self,
        channel_index: ChannelIndex,
        channel: InputChannel,
    ) -> Result<InputChannel, GateError> {
        let mut channels = self.channels.write();
        let num_channels = channels.len();
        let slot = channels
            .get_mut(channel_index.get())
            .ok_or(GateError::IndexOutOfRange {
                channel_index,
                num_channels,
            })?;

        if slot.channel_index() != channel.channel_index()
            || slot.partition_id() != channel.partition_id()
        {
            return Err(GateError::IdentityMismatch {
                expected_index: slot.channel_index(),
                expected_partition: slot.partition_id(),
                actual_index: channel.channel_index(),
                actual_partition: channel.partition_id(),
            });
        }
        Ok(std::mem::replace(slot, channel))
    }

    /// Graduate the unresolved channel for `partition_id` now that its producer was located.
    ///
    /// If partitions were already requested, the new channel requests its subpartition right
    /// away.
    pub async fn update_input_channel(
        &self,
        partition_id: ResultPartitionId,
        location: ProducerLocation,
    ) -> Result<(), GateError> {
        let graduated = {
            let mut channels = self.channels.write();
            let slot = channels
                .iter_mut()
                .find(|c| c.partition_id() == partition_id)
                .ok_or(GateError::UnknownPartition(partition_id))?;

            let InputChannel::Unknown(unknown) = &*slot else {
                return Err(GateError::AlreadyResolved {
                    partition_id,
                    channel_index: slot.channel_index(),
                });
            };
            let graduated = match location {
                ProducerLocation::Local => InputChannel::Local(unknown.to_local()),
                ProducerLocation::Remote(connection_id) => {
                    InputChannel::Remote(unknown.to_remote(connection_id))
                }
            };
            *slot = graduated.clone();
            graduated
        };
        info!(
            channel_index = %graduated.channel_index(),
            %partition_id,
            kind = ?graduated.kind(),
            "updated input channel"
        );

        if self.is_released() {
            graduated.release_all_resources();
        } else if self.requested.load(Ordering::Acquire) {
            graduated.request_subpartition(self.subpartition).await?;
        }
        Ok(())
    }

    /// Request the subpartition from every resolved channel. Only the first call does anything.
    pub async fn request_partitions(&self) -> Result<(), GateError> {
        if self.requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channels = self.channels();
        debug!(
            num_channels = channels.len(),
            subpartition = %self.subpartition,
            "requesting partitions"
        );
        try_join_all(
            channels
                .iter()
                .map(|c| c.request_subpartition(self.subpartition)),
        )
        .await?;
        Ok(())
    }

    /// Take the next buffer from any channel that reported data, without waiting.
    ///
    /// A channel that returned its end-of-partition buffer is released.
    pub fn poll_next(&self) -> Result<Option<(ChannelIndex, BufferAndAvailability)>, GateError> {
        while let Some(channel_index) = self.notifier.pop() {
            let Some(channel) = self.channel(channel_index) else {
                continue;
            };
            let Some(next) = channel.get_next_buffer()? else {
                continue;
            };

            if next.buffer.is_end_of_partition() {
                debug!(%channel_index, "end of partition");
                channel.release_all_resources();
            } else {
                if next.more_available {
                    self.notifier.push(channel_index);
                }
                if let InputChannel::Remote(remote) = &channel {
                    resume_remote(remote)?;
                }
            }
            return Ok(Some((channel_index, next)));
        }
        Ok(None)
    }

    /// Wait until a channel reports data or the gate is finished or released.
    pub async fn wait_for_data(&self) {
        loop {
            let notified = self.notifier.notify.notified();
            if self.notifier.has_pending() || self.is_finished() || self.is_released() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the next buffer. Returns `None` once every channel is finished or the gate was
    /// released.
    pub async fn next_buffer(
        &self,
    ) -> Result<Option<(ChannelIndex, BufferAndAvailability)>, GateError> {
        loop {
            if self.is_released() {
                return Ok(None);
            }
            if let Some(next) = self.poll_next()? {
                return Ok(Some(next));
            }
            if self.is_finished() {
                return Ok(None);
            }
            self.wait_for_data().await;
        }
    }

    /// Send `event` to the producers of all channels.
    pub async fn send_task_event(&self, event: &TaskEvent) -> Result<(), GateError> {
        for channel in self.channels() {
            channel.send_task_event(event).await?;
        }
        Ok(())
    }

    /// Whether every channel has been released. Never true while a channel is unresolved.
    pub fn is_finished(&self) -> bool {
        self.channels.read().iter().all(|c| c.is_released())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn number_of_uninitialized_channels(&self) -> usize {
        self.channels
            .read()
            .iter()
            .filter(|c| matches!(c, InputChannel::Unknown(_)))
            .count()
    }

    /// Release every channel. Idempotent.
    pub fn release_all_resources(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for channel in self.channels() {
            channel.release_all_resources();
        }
        self.notifier.notify.notify_waiters();
        info!(num_channels = self.num_channels(), "released input gate");
    }
}

/// Lift the backpressure of `remote` after a buffer was taken from it.
///
/// A channel released in the meantime has nothing left to resume.
fn resume_remote(remote: &RemoteInputChannel) -> Result<(), GateError> {
    match remote.resume_consumption() {
        Ok(()) | Err(InputChannelError::Released { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

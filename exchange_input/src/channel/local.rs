use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use exchange_id::SubpartitionIndex;
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, error, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::BackoffState,
    buffer::BufferAndAvailability,
    channel::{ChannelIdentity, ChannelResources, ErrorSlot},
    config::ChannelConfig,
    error::{InputChannelError, Result},
    event::{TaskEvent, TaskEventPublisher},
    partition::{PartitionManager, PartitionRequestError, SubpartitionView},
};

/// Reads a subpartition produced in this process, straight from the [`PartitionManager`].
///
/// If the partition is not registered yet the request is retried after the backoff delay on a
/// background task, which is cancelled when the channel is released.
#[derive(Debug)]
pub struct LocalInputChannel {
    identity: ChannelIdentity,
    config: ChannelConfig,
    partition_manager: Arc<dyn PartitionManager>,
    task_event_publisher: Arc<dyn TaskEventPublisher>,
    time_provider: Arc<dyn TimeProvider>,
    state: Mutex<LocalState>,
    released: AtomicBool,
    error: ErrorSlot,
    retry_cancel: CancellationToken,
}

#[derive(Debug)]
struct LocalState {
    view: Option<Box<dyn SubpartitionView>>,
    backoff: BackoffState,
    retry_pending: bool,
    end_of_partition: bool,
}

impl LocalInputChannel {
    pub fn new(
        identity: ChannelIdentity,
        config: ChannelConfig,
        resources: &ChannelResources,
    ) -> Self {
        Self {
            identity,
            config,
            partition_manager: Arc::clone(&resources.partition_manager),
            task_event_publisher: Arc::clone(&resources.task_event_publisher),
            time_provider: Arc::clone(&resources.time_provider),
            state: Mutex::new(LocalState {
                view: None,
                backoff: BackoffState::new(config.backoff, config.retry_limit),
                retry_pending: false,
                end_of_partition: false,
            }),
            released: AtomicBool::new(false),
            error: ErrorSlot::default(),
            retry_cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    /// The delay of the most recent retry, zero if the last request did not fail.
    pub fn current_backoff(&self) -> Duration {
        self.state.lock().backoff.current()
    }

    /// Open a view onto `subpartition`, retrying in the background while the partition is not
    /// registered yet.
    ///
    /// Returns [`InputChannelError::PartitionNotFound`] if the first failure is already beyond
    /// the retry ceiling. Failures of background retries are reported by the next call on the
    /// channel instead.
    pub async fn request_subpartition(
        self: &Arc<Self>,
        subpartition: SubpartitionIndex,
    ) -> Result<()> {
        self.error.check()?;
        self.request(subpartition, false)
    }

    fn request(self: &Arc<Self>, subpartition: SubpartitionIndex, is_retry: bool) -> Result<()> {
        let mut state = self.state.lock();
        if self.is_released() {
            if is_retry {
                return Ok(());
            }
            return Err(self.released_error());
        }

        if is_retry {
            state.retry_pending = false;
        } else if state.view.is_some() || state.retry_pending {
            debug!(
                channel_index = %self.identity.channel_index(),
                partition_id = %self.identity.partition_id(),
                "subpartition already requested"
            );
            return Ok(());
        }
        debug!(
            channel_index = %self.identity.channel_index(),
            partition_id = %self.identity.partition_id(),
            %subpartition,
            "requesting local subpartition"
        );
        match self.partition_manager.find_or_register_listener(
            &self.identity.partition_id(),
            subpartition,
            self.identity.availability_listener(),
        ) {
            Ok(view) => {
                state.backoff.reset();
                state.view = Some(view);
                Ok(())
            }
            Err(PartitionRequestError::NotFound(_)) => {
                match state.backoff.on_failure(self.time_provider.now()) {
                    Some(delay) => {
                        state.retry_pending = true;
                        drop(state);
                        self.schedule_retry(subpartition, delay);
                        Ok(())
                    }
                    None => {
                        let e = InputChannelError::PartitionNotFound {
                            partition_id: self.identity.partition_id(),
                            channel_index: self.identity.channel_index(),
                            attempts: state.backoff.attempts(),
                        };
                        self.error.set(e.clone());
                        Err(e)
                    }
                }
            }
            Err(PartitionRequestError::SubpartitionOutOfRange {
                partition_id,
                subpartition,
            }) => {
                let e = InputChannelError::SubpartitionOutOfRange {
                    partition_id,
                    subpartition,
                };
                self.error.set(e.clone());
                Err(e)
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, subpartition: SubpartitionIndex, delay: Duration) {
        debug!(
            channel_index = %self.identity.channel_index(),
            partition_id = %self.identity.partition_id(),
            ?delay,
            "partition not found, retrying local subpartition request"
        );

        let channel = Arc::clone(self);
        let cancel = self.retry_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(
                        channel_index = %channel.identity.channel_index(),
                        "local subpartition request retry cancelled"
                    );
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = channel.request(subpartition, true) {
                        error!(
                            channel_index = %channel.identity.channel_index(),
                            partition_id = %channel.identity.partition_id(),
                            %e,
                            "local subpartition request failed"
                        );
                        channel.identity.notify_owner();
                    }
                }
            }
        });
    }

    /// Take the next buffer from the subpartition view.
    ///
    /// The end-of-partition buffer is returned once; afterwards, as after a release, there is
    /// never data again.
    pub fn get_next_buffer(&self) -> Result<Option<BufferAndAvailability>> {
        if self.is_released() {
            return Ok(None);
        }
        self.error.check()?;

        let mut state = self.state.lock();
        if state.end_of_partition {
            return Ok(None);
        }
        let Some(view) = state.view.as_mut() else {
            if state.retry_pending {
                return Ok(None);
            }
            return Err(self.not_requested("poll for buffers"));
        };

        match view.next_buffer() {
            Some(next) => {
                if next.buffer.is_end_of_partition() {
                    state.end_of_partition = true;
                }
                Ok(Some(next))
            }
            None if view.is_released() => {
                warn!(
                    channel_index = %self.identity.channel_index(),
                    partition_id = %self.identity.partition_id(),
                    "subpartition released before it was consumed"
                );
                Err(InputChannelError::PartitionReleased {
                    partition_id: self.identity.partition_id(),
                    channel_index: self.identity.channel_index(),
                })
            }
            None => Ok(None),
        }
    }

    pub fn resume_consumption(&self) -> Result<()> {
        self.error.check()?;
        if self.is_released() {
            return Err(self.released_error());
        }
        let mut state = self.state.lock();
        let view = state
            .view
            .as_mut()
            .ok_or_else(|| self.not_requested("resume consumption"))?;
        view.resume_consumption();
        Ok(())
    }

    /// Publish `event` to the producer of the partition.
    pub fn send_task_event(&self, event: &TaskEvent) -> Result<()> {
        self.error.check()?;
        if self.is_released() {
            return Err(self.released_error());
        }
        if self.state.lock().view.is_none() {
            return Err(self.not_requested("send a task event"));
        }

        let partition_id = self.identity.partition_id();
        if !self.task_event_publisher.publish(&partition_id, event) {
            return Err(InputChannelError::ProducerNotFound { partition_id });
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the subpartition view and cancel a pending retry. Idempotent.
    pub fn release_all_resources(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.retry_cancel.cancel();

        let mut state = self.state.lock();
        state.retry_pending = false;
        if let Some(mut view) = state.view.take() {
            view.release();
        }
        debug!(
            channel_index = %self.identity.channel_index(),
            partition_id = %self.identity.partition_id(),
            "released local input channel"
        );
    }

    fn released_error(&self) -> InputChannelError {
        InputChannelError::Released {
            partition_id: self.identity.partition_id(),
            channel_index: self.identity.channel_index(),
        }
    }

    fn not_requested(&self, operation: &'static str) -> InputChannelError {
        InputChannelError::NotRequested {
            operation,
            partition_id: self.identity.partition_id(),
            channel_index: self.identity.channel_index(),
        }
    }
}

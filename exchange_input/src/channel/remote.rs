use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use exchange_id::{ConnectionId, InputChannelId, SubpartitionIndex};
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::BackoffState,
    buffer::{Buffer, BufferAndAvailability},
    channel::{ChannelIdentity, ChannelResources, ErrorSlot},
    config::ChannelConfig,
    connection::{ConnectionError, ConnectionManager, PartitionRequestClient},
    error::{InputChannelError, Result},
    event::TaskEvent,
};

/// Where a [`RemoteInputChannel`] is in its lifecycle.
///
/// ```text
/// Uninitialized -> Requesting <-> Backoff
///                      |
///                      v
///                  Receiving <-> Backpressured
/// ```
///
/// Every state can move to `Released`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChannelState {
    Uninitialized,
    Requesting,
    Backoff,
    Receiving,
    Backpressured,
    Released,
}

/// What happened to a buffer handed to [`RemoteInputChannel::on_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued; the producer may keep sending.
    Accepted,
    /// Queued, but the queue is now full. The producer must wait for
    /// [`PartitionRequestClient::resume_consumption`].
    Backpressured,
    /// Dropped because the channel was released or failed. Pooled buffers went back to their pool.
    Discarded,
}

/// Reads a subpartition from a producer in another process.
///
/// The request client is created on the first request. Responses arrive through the callbacks
/// [`on_buffer`](Self::on_buffer), [`on_failed_partition_request`](Self::on_failed_partition_request)
/// and [`on_error`](Self::on_error), which the client invokes from its I/O tasks.
#[derive(Debug)]
pub struct RemoteInputChannel {
    identity: ChannelIdentity,
    id: InputChannelId,
    connection_id: ConnectionId,
    config: ChannelConfig,
    connection_manager: Arc<dyn ConnectionManager>,
    time_provider: Arc<dyn TimeProvider>,
    state: Mutex<RemoteState>,
    released: AtomicBool,
    error: ErrorSlot,
    retry_cancel: CancellationToken,
}

#[derive(Debug)]
struct RemoteState {
    phase: RemoteChannelState,
    subpartition: Option<SubpartitionIndex>,
    client: Option<Arc<dyn PartitionRequestClient>>,
    /// Runtime on which retries are scheduled; callbacks may come from outside of it.
    runtime: Option<Handle>,
    backoff: BackoffState,
    queue: VecDeque<Buffer>,
    expected_sequence_number: u32,
}

impl RemoteInputChannel {
    pub fn new(
        identity: ChannelIdentity,
        connection_id: ConnectionId,
        config: ChannelConfig,
        resources: &ChannelResources,
    ) -> Self {
        Self {
            identity,
            id: InputChannelId::new(),
            connection_id,
            config,
            connection_manager: Arc::clone(&resources.connection_manager),
            time_provider: Arc::clone(&resources.time_provider),
            state: Mutex::new(RemoteState {
                phase: RemoteChannelState::Uninitialized,
                subpartition: None,
                client: None,
                runtime: None,
                backoff: BackoffState::new(config.backoff, config.retry_limit),
                queue: VecDeque::with_capacity(config.queue_capacity.get()),
                expected_sequence_number: 0,
            }),
            released: AtomicBool::new(false),
            error: ErrorSlot::default(),
            retry_cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    /// Identifies this channel towards the request client.
    pub fn id(&self) -> InputChannelId {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    pub fn state(&self) -> RemoteChannelState {
        self.state.lock().phase
    }

    /// The delay of the most recent retry, zero if the last request did not fail.
    pub fn current_backoff(&self) -> Duration {
        self.state.lock().backoff.current()
    }

    pub fn queued_buffers(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Create the request client and ask the producer for `subpartition`.
    ///
    /// Only the first call does anything. Whether the producer serves the subpartition is
    /// reported later through the callbacks.
    ///
    /// # Panics
    ///
    /// If called outside of a tokio runtime.
    pub async fn request_subpartition(
        self: &Arc<Self>,
        subpartition: SubpartitionIndex,
    ) -> Result<()> {
        self.error.check()?;
        {
            let mut state = self.state.lock();
            match state.phase {
                RemoteChannelState::Released => return Err(self.released_error()),
                RemoteChannelState::Uninitialized => {
                    state.phase = RemoteChannelState::Requesting;
                    state.subpartition = Some(subpartition);
                    state.runtime = Some(Handle::current());
                }
                _ => {
                    debug!(
                        channel_index = %self.identity.channel_index(),
                        partition_id = %self.identity.partition_id(),
                        "subpartition already requested"
                    );
                    return Ok(());
                }
            }
        }

        let client = match self
            .connection_manager
            .create_request_client(&self.connection_id)
            .await
        {
            Ok(client) => client,
            Err(source) => {
                let e = self.connection_error(source);
                self.fail(e.clone());
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock();
            if state.phase == RemoteChannelState::Released {
                drop(state);
                debug!(
                    channel_index = %self.identity.channel_index(),
                    "channel released while connecting, closing request client"
                );
                client.close(self.id);
                return Ok(());
            }
            state.client = Some(Arc::clone(&client));
        }

        self.send_partition_request(client, subpartition).await;
        self.error.check()
    }

    async fn send_partition_request(
        self: &Arc<Self>,
        client: Arc<dyn PartitionRequestClient>,
        subpartition: SubpartitionIndex,
    ) {
        if self.is_released() {
            debug!(
                channel_index = %self.identity.channel_index(),
                "channel released, dropping remote subpartition request"
            );
            return;
        }
        debug!(
            channel_index = %self.identity.channel_index(),
            partition_id = %self.identity.partition_id(),
            connection_id = %self.connection_id,
            %subpartition,
            "requesting remote subpartition"
        );
        if let Err(source) = client
            .request_subpartition(&self.identity.partition_id(), subpartition, Arc::clone(self))
            .await
        {
            self.fail(self.connection_error(source));
        }
    }

    /// Callback for a producer answering the partition request with "not found".
    ///
    /// Schedules a new request after the backoff delay, or fails the channel with
    /// [`InputChannelError::PartitionNotFound`] once the retry ceiling is reached. A report
    /// arriving while a retry is already scheduled is ignored.
    pub fn on_failed_partition_request(self: &Arc<Self>) {
        let (delay, runtime, client, subpartition) = {
            let mut state = self.state.lock();
            match state.phase {
                RemoteChannelState::Released => return,
                RemoteChannelState::Backoff => {
                    debug!(
                        channel_index = %self.identity.channel_index(),
                        "partition request retry already scheduled"
                    );
                    return;
                }
                _ => {}
            }
            let Some(delay) = state.backoff.on_failure(self.time_provider.now()) else {
                let attempts = state.backoff.attempts();
                drop(state);
                self.fail(InputChannelError::PartitionNotFound {
                    partition_id: self.identity.partition_id(),
                    channel_index: self.identity.channel_index(),
                    attempts,
                });
                return;
            };
            state.phase = RemoteChannelState::Backoff;
            (
                delay,
                state.runtime.clone(),
                state.client.clone(),
                state.subpartition,
            )
        };

        let (Some(runtime), Some(client), Some(subpartition)) = (runtime, client, subpartition)
        else {
            warn!(
                channel_index = %self.identity.channel_index(),
                "partition request failure reported for a channel that never sent a request"
            );
            return;
        };

        debug!(
            channel_index = %self.identity.channel_index(),
            partition_id = %self.identity.partition_id(),
            ?delay,
            "partition not found, retrying remote subpartition request"
        );
        let channel = Arc::clone(self);
        let cancel = self.retry_cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(
                        channel_index = %channel.identity.channel_index(),
                        "remote subpartition request retry cancelled"
                    );
                }
                _ = tokio::time::sleep(delay) => {
                    channel.retry_partition_request(client, subpartition).await;
                }
            }
        });
    }

    async fn retry_partition_request(
        self: &Arc<Self>,
        client: Arc<dyn PartitionRequestClient>,
        subpartition: SubpartitionIndex,
    ) {
        {
            let mut state = self.state.lock();
            if state.phase != RemoteChannelState::Backoff {
                return;
            }
            state.phase = RemoteChannelState::Requesting;
        }
        self.send_partition_request(client, subpartition).await;
    }

    /// Callback for a buffer delivered by the producer.
    ///
    /// Buffers must arrive in sequence; a gap fails the channel. The owner is notified when the
    /// queue turns non-empty.
    pub fn on_buffer(&self, buffer: Buffer, sequence_number: u32) -> DeliveryOutcome {
        let capacity = self.config.queue_capacity.get();
        let (outcome, was_empty) = {
            let mut state = self.state.lock();
            if state.phase == RemoteChannelState::Released {
                return DeliveryOutcome::Discarded;
            }

            if sequence_number != state.expected_sequence_number {
                let expected = state.expected_sequence_number;
                drop(state);
                self.fail(InputChannelError::BufferReordering {
                    partition_id: self.identity.partition_id(),
                    channel_index: self.identity.channel_index(),
                    expected,
                    actual: sequence_number,
                });
                return DeliveryOutcome::Discarded;
            }

            if state.queue.len() >= capacity {
                drop(state);
                self.fail(InputChannelError::QueueOverflow {
                    partition_id: self.identity.partition_id(),
                    channel_index: self.identity.channel_index(),
                    capacity,
                });
                return DeliveryOutcome::Discarded;
            }

            let was_empty = state.queue.is_empty();
            state.queue.push_back(buffer);
            state.expected_sequence_number = sequence_number.wrapping_add(1);

            if matches!(
                state.phase,
                RemoteChannelState::Requesting | RemoteChannelState::Backoff
            ) {
                state.backoff.reset();
                state.phase = RemoteChannelState::Receiving;
            }

            let outcome = if state.queue.len() >= capacity {
                state.phase = RemoteChannelState::Backpressured;
                DeliveryOutcome::Backpressured
            } else {
                DeliveryOutcome::Accepted
            };
            (outcome, was_empty)
        };

        if was_empty {
            self.identity.notify_owner();
        }
        outcome
    }

    /// Callback for a failure of the connection serving this channel.
    pub fn on_error(&self, error: ConnectionError) {
        if self.is_released() {
            debug!(
                channel_index = %self.identity.channel_index(),
                %error,
                "ignoring connection error on released channel"
            );
            return;
        }
        self.fail(self.connection_error(error));
    }

    /// Take the next queued buffer.
    pub fn get_next_buffer(&self) -> Result<Option<BufferAndAvailability>> {
        if self.is_released() {
            return Ok(None);
        }
        self.error.check()?;

        let mut state = self.state.lock();
        match state.phase {
            RemoteChannelState::Released => return Ok(None),
            RemoteChannelState::Uninitialized => {
                return Err(self.not_requested("poll for buffers"));
            }
            _ => {}
        }
        let Some(buffer) = state.queue.pop_front() else {
            return Ok(None);
        };
        Ok(Some(BufferAndAvailability {
            buffer,
            more_available: !state.queue.is_empty(),
        }))
    }

    /// Let a backpressured producer continue once the queue has room again.
    pub fn resume_consumption(&self) -> Result<()> {
        self.error.check()?;
        let client = {
            let mut state = self.state.lock();
            if state.phase == RemoteChannelState::Released {
                return Err(self.released_error());
            }
            let Some(client) = state.client.clone() else {
                return Err(self.not_requested("resume consumption"));
            };
            if state.phase != RemoteChannelState::Backpressured
                || state.queue.len() >= self.config.queue_capacity.get()
            {
                return Ok(());
            }
            state.phase = RemoteChannelState::Receiving;
            client
        };
        client.resume_consumption(self.id);
        Ok(())
    }

    /// Send `event` to the producer over the request client.
    pub async fn send_task_event(self: &Arc<Self>, event: &TaskEvent) -> Result<()> {
        self.error.check()?;
        let client = {
            let state = self.state.lock();
            if state.phase == RemoteChannelState::Released {
                return Err(self.released_error());
            }
            state
                .client
                .clone()
                .ok_or_else(|| self.not_requested("send a task event"))?
        };

        let bytes = event.to_bytes()?;
        client
            .send_task_event(&self.identity.partition_id(), bytes, Arc::clone(self))
            .await
            .map_err(|source| self.connection_error(source))
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Cancel a pending retry, drop queued buffers and close the client for this channel.
    /// Idempotent.
    pub fn release_all_resources(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.retry_cancel.cancel();

        let (client, discarded) = {
            let mut state = self.state.lock();
            state.phase = RemoteChannelState::Released;
            (state.client.take(), std::mem::take(&mut state.queue))
        };
        let discarded = discarded.len();

        match client {
            Some(client) => client.close(self.id),
            None => self
                .connection_manager
                .close_open_channel_connections(&self.connection_id),
        }
        info!(
            channel_index = %self.identity.channel_index(),
            partition_id = %self.identity.partition_id(),
            connection_id = %self.connection_id,
            discarded,
            "released remote input channel"
        );
    }

    /// Record a fatal error for the consumer and wake up the owner to observe it.
    fn fail(&self, e: InputChannelError) {
        if !self.error.set(e.clone()) {
            return;
        }
        error!(
            channel_index = %self.identity.channel_index(),
            partition_id = %self.identity.partition_id(),
            connection_id = %self.connection_id,
            %e,
            "remote input channel failed"
        );
        self.identity.notify_owner();
    }

    fn connection_error(&self, source: ConnectionError) -> InputChannelError {
        InputChannelError::Connection {
            partition_id: self.identity.partition_id(),
            channel_index: self.identity.channel_index(),
            source,
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    use std::num::NonZeroUsize;

    use exchange_id::{ChannelIndex, PartitionSlot, ProducerId, ResultPartitionId};

    use crate::{
        backoff::BackoffConfig,
        buffer::BufferPool,
        testing::{RecordingOwner, TestResources, connection_id, test_resources},
    };

    struct Fixture {
        resources: TestResources,
        owner: Arc<RecordingOwner>,
        channel: Arc<RemoteInputChannel>,
    }

    fn fixture(config: ChannelConfig) -> Fixture {
        let resources = test_resources();
        let owner = Arc::new(RecordingOwner::default());
        let identity = ChannelIdentity::new(
            ChannelIndex::new(1),
            ResultPartitionId::new(ProducerId::new(), PartitionSlot::new(0)),
            Arc::clone(&owner) as _,
        );
        let channel = Arc::new(RemoteInputChannel::new(
            identity,
            connection_id(1),
            config,
            &resources.resources,
        ));
        Fixture {
            resources,
            owner,
            channel,
        }
    }

    fn small_queue() -> ChannelConfig {
        ChannelConfig::new(
            BackoffConfig::new(Duration::from_millis(5), Duration::from_secs(1)).unwrap(),
        )
        .with_queue_capacity(NonZeroUsize::new(2).unwrap())
    }

    async fn requested(config: ChannelConfig) -> Fixture {
        let f = fixture(config);
        f.channel
            .request_subpartition(SubpartitionIndex::new(0))
            .await
            .unwrap();
        f
    }

    #[test_log::test(tokio::test)]
    async fn test_request_creates_client_once() {
        let f = requested(small_queue()).await;
        assert_eq!(f.channel.state(), RemoteChannelState::Requesting);
        f.channel
            .request_subpartition(SubpartitionIndex::new(0))
            .await
            .unwrap();

        assert_eq!(f.resources.connections.clients_created(), 1);
        assert_eq!(f.resources.connections.client().requests().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_poll_before_request_is_misuse() {
        let f = fixture(small_queue());
        assert!(matches!(
            f.channel.get_next_buffer(),
            Err(InputChannelError::NotRequested { .. })
        ));
        assert!(matches!(
            f.channel
                .send_task_event(&TaskEvent::new("early", vec![]))
                .await,
            Err(InputChannelError::NotRequested { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_buffers_queue_and_backpressure() {
        let f = requested(small_queue()).await;
        let client = f.resources.connections.client();

        assert_eq!(
            f.channel.on_buffer(Buffer::data("a"), 0),
            DeliveryOutcome::Accepted
        );
        assert_eq!(f.channel.state(), RemoteChannelState::Receiving);
        assert_eq!(f.owner.notifications().len(), 1);
        assert_eq!(
            f.channel.on_buffer(Buffer::data("b"), 1),
            DeliveryOutcome::Backpressured
        );
        assert_eq!(f.channel.state(), RemoteChannelState::Backpressured);
        assert_eq!(f.owner.notifications().len(), 1);

        // still full
        f.channel.resume_consumption().unwrap();
        assert!(client.resumed().is_empty());

        let first = f.channel.get_next_buffer().unwrap().unwrap();
        assert_eq!(first.buffer.bytes().as_ref(), b"a");
        assert!(first.more_available);

        f.channel.resume_consumption().unwrap();
        assert_eq!(client.resumed(), vec![f.channel.id()]);
        assert_eq!(f.channel.state(), RemoteChannelState::Receiving);

        let second = f.channel.get_next_buffer().unwrap().unwrap();
        assert!(!second.more_available);
        assert!(f.channel.get_next_buffer().unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_out_of_order_buffer_fails_channel() {
        let f = requested(small_queue()).await;
        f.channel.on_buffer(Buffer::data("a"), 0);
        assert_eq!(
            f.channel.on_buffer(Buffer::data("c"), 2),
            DeliveryOutcome::Discarded
        );
        assert!(matches!(
            f.channel.get_next_buffer(),
            Err(InputChannelError::BufferReordering {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_overflow_fails_channel() {
        let f = requested(small_queue()).await;
        f.channel.on_buffer(Buffer::data("a"), 0);
        f.channel.on_buffer(Buffer::data("b"), 1);
        assert_eq!(
            f.channel.on_buffer(Buffer::data("c"), 2),
            DeliveryOutcome::Discarded
        );
        assert!(matches!(
            f.channel.get_next_buffer(),
            Err(InputChannelError::QueueOverflow { capacity: 2, .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_connection_error_reported() {
        let f = requested(small_queue()).await;
        f.channel
            .on_error(ConnectionError::Remote(Arc::from("producer crashed")));
        assert_eq!(f.owner.notifications().len(), 1);
        assert!(matches!(
            f.channel.get_next_buffer(),
            Err(InputChannelError::Connection { .. })
        ));
        assert!(matches!(
            f.channel
                .request_subpartition(SubpartitionIndex::new(0))
                .await,
            Err(InputChannelError::Connection { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_connect_is_fatal() {
        let f = fixture(small_queue());
        f.resources.connections.fail_next_connect();
        let err = f
            .channel
            .request_subpartition(SubpartitionIndex::new(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InputChannelError::Connection {
                source: ConnectionError::Connect { .. },
                ..
            }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_release_discards_buffers_and_closes_client() {
        let f = requested(small_queue()).await;
        let pool = BufferPool::new(4);
        f.channel.on_buffer(pool.try_lease("a").unwrap(), 0);
        f.channel.on_buffer(pool.try_lease("b").unwrap(), 1);
        assert_eq!(pool.leased(), 2);

        f.channel.release_all_resources();
        f.channel.release_all_resources();
        assert!(f.channel.is_released());
        assert_eq!(f.channel.state(), RemoteChannelState::Released);
        assert_eq!(pool.leased(), 0);
        assert_eq!(
            f.resources.connections.client().closed(),
            vec![f.channel.id()]
        );

        assert_eq!(
            f.channel.on_buffer(pool.try_lease("late").unwrap(), 2),
            DeliveryOutcome::Discarded
        );
        assert_eq!(pool.leased(), 0);
        for _ in 0..3 {
            assert!(f.channel.get_next_buffer().unwrap().is_none());
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_release_without_client_closes_connections() {
        let f = fixture(small_queue());
        f.channel.release_all_resources();
        assert_eq!(
            f.resources.connections.closed_connections(),
            vec![connection_id(1)]
        );
        assert!(f.resources.connections.client().closed().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_task_event_serialized_over_client() {
        let f = requested(small_queue()).await;
        let event = TaskEvent::new("iteration", vec![1, 2]);
        f.channel.send_task_event(&event).await.unwrap();

        let sent = f.resources.connections.client().events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, f.channel.identity().partition_id());
        assert_eq!(sent[0].1, event);
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_ceiling_fails_channel() {
        let config = ChannelConfig::new(
            BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(4)).unwrap(),
        );
        let f = fixture(config);
        f.resources.connections.client().fail_requests(u32::MAX);
        f.channel
            .request_subpartition(SubpartitionIndex::new(0))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.owner.notifications().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        // delays 1ms, 2ms, 4ms, then the ceiling
        assert_eq!(f.resources.connections.client().requests().len(), 4);
        assert!(matches!(
            f.channel.get_next_buffer(),
            Err(InputChannelError::PartitionNotFound { attempts: 4, .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_release_during_backoff_cancels_retry() {
        let config = ChannelConfig::new(
            BackoffConfig::new(Duration::from_millis(50), Duration::from_secs(1)).unwrap(),
        );
        let f = fixture(config);
        let client = f.resources.connections.client();
        client.fail_requests(1);
        f.channel
            .request_subpartition(SubpartitionIndex::new(0))
            .await
            .unwrap();
        assert_eq!(f.channel.state(), RemoteChannelState::Backoff);

        f.channel.release_all_resources();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(client.requests().len(), 1);
        assert_eq!(client.successful_requests(), 0);
        assert!(f.channel.get_next_buffer().unwrap().is_none());
        assert!(f.owner.notifications().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_no_request_sent_after_release() {
        let f = requested(small_queue()).await;
        let client = f.resources.connections.client();
        assert_eq!(client.requests().len(), 1);

        f.channel.release_all_resources();
        f.channel
            .send_partition_request(client as _, SubpartitionIndex::new(0))
            .await;

        let client = f.resources.connections.client();
        assert_eq!(client.requests().len(), 1);
        assert_eq!(client.closed(), vec![f.channel.id()]);
    }

    #[test_log::test(tokio::test)]
    async fn test_repeated_failure_during_backoff_counts_once() {
        let config = ChannelConfig::new(
            BackoffConfig::new(Duration::from_millis(50), Duration::from_secs(1)).unwrap(),
        );
        let f = fixture(config);
        let client = f.resources.connections.client();
        client.fail_requests(1);
        f.channel
            .request_subpartition(SubpartitionIndex::new(0))
            .await
            .unwrap();
        assert_eq!(f.channel.state(), RemoteChannelState::Backoff);
        assert_eq!(f.channel.current_backoff(), Duration::from_millis(50));

        f.channel.on_failed_partition_request();
        assert_eq!(f.channel.state(), RemoteChannelState::Backoff);
        assert_eq!(f.channel.current_backoff(), Duration::from_millis(50));

        tokio::time::timeout(Duration::from_secs(5), client.wait_for_success())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.requests().len(), 2);
        assert_eq!(client.successful_requests(), 1);
    }
}

//! Test doubles for the collaborators of input channels.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use exchange_id::{
    ChannelIndex, ConnectionId, InputChannelId, ResultPartitionId, SubpartitionIndex,
};
use iox_time::{MockProvider, Time};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    channel::{ChannelResources, remote::RemoteInputChannel},
    connection::{ConnectionError, ConnectionManager, PartitionRequestClient},
    event::{TaskEvent, TaskEventDispatcher},
    gate::ChannelOwner,
    partition::ResultPartitionManager,
};

/// A [`ConnectionId`] on localhost with the given connection index.
pub fn connection_id(connection_index: u32) -> ConnectionId {
    ConnectionId::new(
        SocketAddr::from((Ipv4Addr::LOCALHOST, 7070)),
        connection_index,
    )
}

/// Records the notifications it receives.
#[derive(Debug, Default)]
pub struct RecordingOwner {
    notifications: Mutex<Vec<ChannelIndex>>,
}

impl RecordingOwner {
    pub fn notifications(&self) -> Vec<ChannelIndex> {
        self.notifications.lock().clone()
    }
}

impl ChannelOwner for RecordingOwner {
    fn notify_channel_non_empty(&self, channel_index: ChannelIndex) {
        self.notifications.lock().push(channel_index);
    }
}

/// [`ChannelResources`] backed by in-memory collaborators, with typed handles to each of them.
#[derive(Debug)]
pub struct TestResources {
    pub resources: ChannelResources,
    pub partitions: Arc<ResultPartitionManager>,
    pub events: Arc<TaskEventDispatcher>,
    pub connections: Arc<MockConnectionManager>,
    pub time: Arc<MockProvider>,
}

pub fn test_resources() -> TestResources {
    let partitions = Arc::new(ResultPartitionManager::new());
    let events = Arc::new(TaskEventDispatcher::new());
    let connections = Arc::new(MockConnectionManager::default());
    let time = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
    TestResources {
        resources: ChannelResources::new(
            Arc::clone(&partitions) as _,
            Arc::clone(&events) as _,
            Arc::clone(&connections) as _,
            Arc::clone(&time) as _,
        ),
        partitions,
        events,
        connections,
        time,
    }
}

/// Hands out a single shared [`MockPartitionRequestClient`].
#[derive(Debug, Default)]
pub struct MockConnectionManager {
    client: Arc<MockPartitionRequestClient>,
    clients_created: AtomicUsize,
    fail_next_connect: AtomicBool,
    closed_connections: Mutex<Vec<ConnectionId>>,
}

impl MockConnectionManager {
    pub fn client(&self) -> Arc<MockPartitionRequestClient> {
        Arc::clone(&self.client)
    }

    pub fn clients_created(&self) -> usize {
        self.clients_created.load(Ordering::SeqCst)
    }

    /// Make the next [`ConnectionManager::create_request_client`] call fail.
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    pub fn closed_connections(&self) -> Vec<ConnectionId> {
        self.closed_connections.lock().clone()
    }
}

#[async_trait]
impl ConnectionManager for MockConnectionManager {
    async fn create_request_client(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn PartitionRequestClient>, ConnectionError> {
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(ConnectionError::Connect {
                connection_id: *connection_id,
                message: Arc::from("connection refused"),
            });
        }
        self.clients_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.client) as _)
    }

    fn close_open_channel_connections(&self, connection_id: &ConnectionId) {
        self.closed_connections.lock().push(*connection_id);
    }
}

/// Answers partition requests with "not found" a scripted number of times, then accepts them.
///
/// Nothing is streamed on success; tests deliver buffers through
/// [`RemoteInputChannel::on_buffer`] themselves.
#[derive(Debug, Default)]
pub struct MockPartitionRequestClient {
    not_found_remaining: AtomicU32,
    requests: Mutex<Vec<(ResultPartitionId, SubpartitionIndex)>>,
    successful_requests: AtomicUsize,
    request_succeeded: Notify,
    resumed: Mutex<Vec<InputChannelId>>,
    closed: Mutex<Vec<InputChannelId>>,
    events: Mutex<Vec<(ResultPartitionId, TaskEvent)>>,
}

impl MockPartitionRequestClient {
    /// Answer the next `n` partition requests with "not found".
    pub fn fail_requests(&self, n: u32) {
        self.not_found_remaining.store(n, Ordering::SeqCst);
    }

    /// All partition requests received, failed ones included.
    pub fn requests(&self) -> Vec<(ResultPartitionId, SubpartitionIndex)> {
        self.requests.lock().clone()
    }

    pub fn successful_requests(&self) -> usize {
        self.successful_requests.load(Ordering::SeqCst)
    }

    /// Wait until at least one partition request was accepted.
    pub async fn wait_for_success(&self) {
        loop {
            let notified = self.request_succeeded.notified();
            if self.successful_requests() > 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn resumed(&self) -> Vec<InputChannelId> {
        self.resumed.lock().clone()
    }

    pub fn closed(&self) -> Vec<InputChannelId> {
        self.closed.lock().clone()
    }

    /// Task events received, deserialized.
    pub fn events(&self) -> Vec<(ResultPartitionId, TaskEvent)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl PartitionRequestClient for MockPartitionRequestClient {
    async fn request_subpartition(
        &self,
        partition_id: &ResultPartitionId,
        subpartition: SubpartitionIndex,
        channel: Arc<RemoteInputChannel>,
    ) -> Result<(), ConnectionError> {
        self.requests.lock().push((*partition_id, subpartition));

        let not_found = self
            .not_found_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if not_found {
            channel.on_failed_partition_request();
        } else {
            self.successful_requests.fetch_add(1, Ordering::SeqCst);
            self.request_succeeded.notify_waiters();
        }
        Ok(())
    }

    async fn send_task_event(
        &self,
        partition_id: &ResultPartitionId,
        event: Bytes,
        _channel: Arc<RemoteInputChannel>,
    ) -> Result<(), ConnectionError> {
        let event = TaskEvent::from_bytes(&event)
            .map_err(|e| ConnectionError::Remote(Arc::from(e.to_string())))?;
        self.events.lock().push((*partition_id, event));
        Ok(())
    }

    fn resume_consumption(&self, channel_id: InputChannelId) {
        self.resumed.lock().push(channel_id);
    }

    fn close(&self, channel_id: InputChannelId) {
        self.closed.lock().push(channel_id);
    }
}

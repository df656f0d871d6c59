//! Control events sent from consumers back to the producers of their partitions.

use std::fmt::Debug;

use bytes::Bytes;
use exchange_id::ResultPartitionId;
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::InputChannelError;

/// An event travelling upstream, against the flow of data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Identifies the kind of event for the producer-side handler.
    pub kind: String,
    pub payload: Vec<u8>,
}

impl TaskEvent {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    /// Serialize the event for sending it over a connection.
    pub fn to_bytes(&self) -> Result<Bytes, InputChannelError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| InputChannelError::EventSerialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Delivers task events to producers running in the same process.
pub trait TaskEventPublisher: Debug + Send + Sync + 'static {
    /// Publish `event` to the producer of `partition_id`.
    ///
    /// Returns `false` if no producer for the partition is registered.
    fn publish(&self, partition_id: &ResultPartitionId, event: &TaskEvent) -> bool;
}

/// In-process [`TaskEventPublisher`] that routes events to registered producers.
#[derive(Debug, Default)]
pub struct TaskEventDispatcher {
    handlers: RwLock<HashMap<ResultPartitionId, mpsc::UnboundedSender<TaskEvent>>>,
}

impl TaskEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the producer of `partition_id` and return the stream of events sent to it.
    ///
    /// # Panics
    ///
    /// If the partition has already been registered.
    pub fn register_partition(
        &self,
        partition_id: ResultPartitionId,
    ) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(
            self.handlers.write().insert(partition_id, tx).is_none(),
            "partition {partition_id} registered with the task event dispatcher more than once"
        );
        rx
    }

    pub fn unregister_partition(&self, partition_id: &ResultPartitionId) {
        self.handlers.write().remove(partition_id);
    }
}

impl TaskEventPublisher for TaskEventDispatcher {
    fn publish(&self, partition_id: &ResultPartitionId, event: &TaskEvent) -> bool {
        let handlers = self.handlers.read();
        let Some(tx) = handlers.get(partition_id) else {
            debug!(%partition_id, kind = %event.kind, "no producer registered for task event");
            return false;
        };
        tx.send(event.clone()).is_ok()
    }
}

//! In-process result partitions, read by [`LocalInputChannel`]s.
//!
//! [`LocalInputChannel`]: crate::channel::local::LocalInputChannel

use std::{collections::VecDeque, fmt::Debug, sync::Arc};

use exchange_id::{ResultPartitionId, SubpartitionIndex};
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::{Buffer, BufferAndAvailability};

/// Notified by a subpartition when it turns from empty to non-empty.
pub trait BufferAvailabilityListener: Debug + Send + Sync + 'static {
    fn notify_data_available(&self);
}

/// A consumer's read handle onto one subpartition.
pub trait SubpartitionView: Debug + Send + 'static {
    /// Take the next buffer without blocking.
    fn next_buffer(&mut self) -> Option<BufferAndAvailability>;

    /// Re-arm availability notifications after the consumer paused.
    fn resume_consumption(&mut self);

    fn release(&mut self);

    /// Whether the view or the partition behind it has been released.
    fn is_released(&self) -> bool;
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum PartitionRequestError {
    #[error("partition {0} not found")]
    NotFound(ResultPartitionId),

    #[error("subpartition {subpartition} does not exist in partition {partition_id}")]
    SubpartitionOutOfRange {
        partition_id: ResultPartitionId,
        subpartition: SubpartitionIndex,
    },
}

/// Lookup of partitions produced in this process.
pub trait PartitionManager: Debug + Send + Sync + 'static {
    /// Open a view onto `subpartition` of `partition_id` that reports new data to `listener`.
    ///
    /// [`PartitionRequestError::NotFound`] is transient: the producer may not have registered
    /// the partition yet.
    fn find_or_register_listener(
        &self,
        partition_id: &ResultPartitionId,
        subpartition: SubpartitionIndex,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<Box<dyn SubpartitionView>, PartitionRequestError>;
}

/// Registry of the result partitions produced by the tasks of this process.
#[derive(Debug, Default)]
pub struct ResultPartitionManager {
    partitions: RwLock<HashMap<ResultPartitionId, Arc<ResultPartition>>>,
}

impl ResultPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `partition` visible to consumers.
    ///
    /// # Panics
    ///
    /// If a partition with the same id has already been registered.
    pub fn register_partition(&self, partition: Arc<ResultPartition>) {
        let partition_id = partition.id();
        assert!(
            self.partitions
                .write()
                .insert(partition_id, partition)
                .is_none(),
            "result partition {partition_id} registered more than once"
        );
        debug!(%partition_id, "registered result partition");
    }

    /// Remove the partition and release its subpartitions, discarding unread buffers.
    pub fn release_partition(&self, partition_id: &ResultPartitionId) {
        if let Some(partition) = self.partitions.write().remove(partition_id) {
            partition.release();
            debug!(%partition_id, "released result partition");
        }
    }
}

impl PartitionManager for ResultPartitionManager {
    fn find_or_register_listener(
        &self,
        partition_id: &ResultPartitionId,
        subpartition: SubpartitionIndex,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<Box<dyn SubpartitionView>, PartitionRequestError> {
        let partition = self
            .partitions
            .read()
            .get(partition_id)
            .map(Arc::clone)
            .ok_or(PartitionRequestError::NotFound(*partition_id))?;

        let view = partition.create_view(subpartition, listener)?;
        Ok(Box::new(view))
    }
}

/// The output of one producer, split into pipelined subpartitions.
#[derive(Debug)]
pub struct ResultPartition {
    id: ResultPartitionId,
    subpartitions: Vec<Arc<PipelinedSubpartition>>,
}

impl ResultPartition {
    pub fn new(id: ResultPartitionId, num_subpartitions: usize) -> Self {
        Self {
            id,
            subpartitions: (0..num_subpartitions)
                .map(|_| Arc::new(PipelinedSubpartition::default()))
                .collect(),
        }
    }

    pub fn id(&self) -> ResultPartitionId {
        self.id
    }

    pub fn num_subpartitions(&self) -> usize {
        self.subpartitions.len()
    }

    /// Append `buffer` to `subpartition`.
    ///
    /// Returns `false` if the subpartition does not exist or no longer accepts data.
    pub fn add(&self, subpartition: SubpartitionIndex, buffer: Buffer) -> bool {
        self.subpartitions
            .get(subpartition.as_usize())
            .is_some_and(|s| s.add(buffer))
    }

    /// Mark every subpartition as complete by appending an end-of-partition marker.
    pub fn finish(&self) {
        for subpartition in &self.subpartitions {
            subpartition.finish();
        }
    }

    fn release(&self) {
        for subpartition in &self.subpartitions {
            subpartition.release();
        }
    }

    fn create_view(
        &self,
        subpartition: SubpartitionIndex,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<PipelinedSubpartitionView, PartitionRequestError> {
        let target = self.subpartitions.get(subpartition.as_usize()).ok_or(
            PartitionRequestError::SubpartitionOutOfRange {
                partition_id: self.id,
                subpartition,
            },
        )?;
        Ok(PipelinedSubpartitionView::new(Arc::clone(target), listener))
    }
}

#[derive(Debug, Default)]
struct PipelinedSubpartition {
    state: Mutex<SubpartitionState>,
}

#[derive(Debug, Default)]
struct SubpartitionState {
    buffers: VecDeque<Buffer>,
    finished: bool,
    released: bool,
    listener: Option<Arc<dyn BufferAvailabilityListener>>,
}

impl PipelinedSubpartition {
    fn add(&self, buffer: Buffer) -> bool {
        let listener = {
            let mut state = self.state.lock();
            if state.finished || state.released {
                return false;
            }
            state.buffers.push_back(buffer);
            state.listener_if_first()
        };
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
        true
    }

    fn finish(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.finished || state.released {
                return;
            }
            state.buffers.push_back(Buffer::end_of_partition());
            state.finished = true;
            state.listener_if_first()
        };
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    fn release(&self) {
        let discarded = {
            let mut state = self.state.lock();
            state.released = true;
            state.listener = None;
            std::mem::take(&mut state.buffers)
        };
        drop(discarded);
    }

    fn register_listener(&self, listener: Arc<dyn BufferAvailabilityListener>) {
        let has_data = {
            let mut state = self.state.lock();
            state.listener = Some(Arc::clone(&listener));
            !state.buffers.is_empty()
        };
        if has_data {
            listener.notify_data_available();
        }
    }

    fn unregister_listener(&self) {
        self.state.lock().listener = None;
    }

    fn poll(&self) -> Option<BufferAndAvailability> {
        let mut state = self.state.lock();
        let buffer = state.buffers.pop_front()?;
        Some(BufferAndAvailability {
            buffer,
            more_available: !state.buffers.is_empty(),
        })
    }

    fn notify_if_available(&self) {
        let listener = {
            let state = self.state.lock();
            if state.buffers.is_empty() {
                None
            } else {
                state.listener.clone()
            }
        };
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

impl SubpartitionState {
    fn listener_if_first(&self) -> Option<Arc<dyn BufferAvailabilityListener>> {
        if self.buffers.len() == 1 {
            self.listener.clone()
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct PipelinedSubpartitionView {
    subpartition: Arc<PipelinedSubpartition>,
    released: bool,
}

impl PipelinedSubpartitionView {
    fn new(
        subpartition: Arc<PipelinedSubpartition>,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Self {
        subpartition.register_listener(listener);
        Self {
            subpartition,
            released: false,
        }
    }
}

impl SubpartitionView for PipelinedSubpartitionView {
    fn next_buffer(&mut self) -> Option<BufferAndAvailability> {
        if self.released {
            return None;
        }
        self.subpartition.poll()
    }

    fn resume_consumption(&mut self) {
        if !self.released {
            self.subpartition.notify_if_available();
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.subpartition.unregister_listener();
        }
    }

    fn is_released(&self) -> bool {
        self.released || self.subpartition.is_released()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use exchange_id::{PartitionSlot, ProducerId};

    #[derive(Debug, Default)]
    struct CountingListener(AtomicUsize);

    impl BufferAvailabilityListener for CountingListener {
        fn notify_data_available(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn partition_id() -> ResultPartitionId {
        ResultPartitionId::new(ProducerId::new(), PartitionSlot::new(0))
    }

    #[test_log::test(test)]
    fn test_not_found_until_registered() {
        let manager = ResultPartitionManager::new();
        let id = partition_id();
        let listener = Arc::new(CountingListener::default());

        let err = manager
            .find_or_register_listener(
                &id,
                SubpartitionIndex::new(0),
                Arc::clone(&listener) as _,
            )
            .unwrap_err();
        assert!(matches!(err, PartitionRequestError::NotFound(p) if p == id));

        manager.register_partition(Arc::new(ResultPartition::new(id, 2)));
        assert!(
            manager
                .find_or_register_listener(
                    &id,
                    SubpartitionIndex::new(1),
                    Arc::clone(&listener) as _,
                )
                .is_ok()
        );
        let err = manager
            .find_or_register_listener(&id, SubpartitionIndex::new(2), listener)
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionRequestError::SubpartitionOutOfRange { .. }
        ));
    }

    #[test_log::test(test)]
    fn test_listener_notified_on_first_buffer_only() {
        let manager = ResultPartitionManager::new();
        let id = partition_id();
        let partition = Arc::new(ResultPartition::new(id, 1));
        manager.register_partition(Arc::clone(&partition));

        let listener = Arc::new(CountingListener::default());
        let mut view = manager
            .find_or_register_listener(
                &id,
                SubpartitionIndex::new(0),
                Arc::clone(&listener) as _,
            )
            .unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);

        assert!(partition.add(SubpartitionIndex::new(0), Buffer::data("a")));
        assert!(partition.add(SubpartitionIndex::new(0), Buffer::data("b")));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        let first = view.next_buffer().unwrap();
        assert_eq!(first.buffer.bytes().as_ref(), b"a");
        assert!(first.more_available);
        let second = view.next_buffer().unwrap();
        assert!(!second.more_available);
        assert!(view.next_buffer().is_none());

        partition.finish();
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
        assert!(view.next_buffer().unwrap().buffer.is_end_of_partition());
        assert!(!partition.add(SubpartitionIndex::new(0), Buffer::data("late")));
    }

    #[test_log::test(test)]
    fn test_existing_data_notifies_on_registration() {
        let manager = ResultPartitionManager::new();
        let id = partition_id();
        let partition = Arc::new(ResultPartition::new(id, 1));
        partition.add(SubpartitionIndex::new(0), Buffer::data("a"));
        manager.register_partition(partition);

        let listener = Arc::new(CountingListener::default());
        let _view = manager
            .find_or_register_listener(
                &id,
                SubpartitionIndex::new(0),
                Arc::clone(&listener) as _,
            )
            .unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(test)]
    fn test_release_partition_discards_buffers() {
        let manager = ResultPartitionManager::new();
        let id = partition_id();
        let partition = Arc::new(ResultPartition::new(id, 1));
        manager.register_partition(Arc::clone(&partition));
        let mut view = manager
            .find_or_register_listener(
                &id,
                SubpartitionIndex::new(0),
                Arc::new(CountingListener::default()),
            )
            .unwrap();
        partition.add(SubpartitionIndex::new(0), Buffer::data("a"));

        manager.release_partition(&id);
        assert!(view.is_released());
        assert!(view.next_buffer().is_none());
        assert!(matches!(
            manager.find_or_register_listener(
                &id,
                SubpartitionIndex::new(0),
                Arc::new(CountingListener::default())
            ),
            Err(PartitionRequestError::NotFound(_))
        ));
    }
}

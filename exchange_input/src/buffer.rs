//! Buffers handed from producers to input channels.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;

/// What a [`Buffer`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Serialized records, opaque to the channel.
    Data,
    /// Marker that the producer finished the subpartition. Carries no payload.
    EndOfPartition,
}

/// A unit of data moved through an input channel.
///
/// A buffer leased from a [`BufferPool`] gives its lease back when dropped, so whoever discards
/// buffers (e.g. a channel draining its queue on release) returns them to the pool.
#[derive(Debug)]
pub struct Buffer {
    kind: BufferKind,
    data: Bytes,
    _lease: Option<Lease>,
}

impl Buffer {
    /// A data buffer that does not belong to any pool.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            kind: BufferKind::Data,
            data: data.into(),
            _lease: None,
        }
    }

    pub fn end_of_partition() -> Self {
        Self {
            kind: BufferKind::EndOfPartition,
            data: Bytes::new(),
            _lease: None,
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn is_end_of_partition(&self) -> bool {
        self.kind == BufferKind::EndOfPartition
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A buffer returned by a non-blocking poll, together with whether the channel already holds
/// more buffers.
#[derive(Debug)]
pub struct BufferAndAvailability {
    pub buffer: Buffer,
    pub more_available: bool,
}

/// A fixed number of buffer leases shared by the producers writing into input channels.
///
/// It is cheap to clone; clones share the same leases.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    leased: AtomicUsize,
}

#[derive(Debug)]
struct Lease {
    pool: Arc<PoolInner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.leased.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                leased: AtomicUsize::new(0),
            }),
        }
    }

    /// Wrap `data` into a pooled data buffer, or return `None` if every lease is taken.
    pub fn try_lease(&self, data: impl Into<Bytes>) -> Option<Buffer> {
        let capacity = self.inner.capacity;
        self.inner
            .leased
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |leased| {
                (leased < capacity).then_some(leased + 1)
            })
            .ok()?;

        Some(Buffer {
            kind: BufferKind::Data,
            data: data.into(),
            _lease: Some(Lease {
                pool: Arc::clone(&self.inner),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently out of the pool.
    pub fn leased(&self) -> usize {
        self.inner.leased.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.leased()
    }
}

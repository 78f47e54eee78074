//! Data-path messages and output buffer pools.
//!
//! An external output owns a [`BufferPool`]. Buffers leave the pool as
//! [`PooledBuf`] values and travel to the downstream container inside a
//! [`DataMessage`]; dropping a `PooledBuf` returns its storage to the pool
//! it came from. Ownership crosses containers only at send/receive.
//!
//! A pool created [`with_signal`](BufferPool::with_signal) sets that bit
//! whenever a buffer comes home, so the owning container can resume work
//! it parked while the pool was empty.

use crossbeam_channel::{Receiver, Sender};

use super::signal::Signal;
use crate::media::Timestamp;

/// Storage backed by a pool, returned on drop.
pub struct PooledBuf {
    data: Vec<u8>,
    home: Option<Sender<Vec<u8>>>,
    wake: Option<Signal>,
}

impl PooledBuf {
    /// A buffer not owned by any pool (one-time prebuffers, tests).
    pub fn detached(data: Vec<u8>) -> Self {
        Self {
            data,
            home: None,
            wake: None,
        }
    }

    /// Returns `true` if dropping this buffer returns it to a pool.
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    /// Read access to the payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the payload.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies a pooled payload into detached storage and sends the pooled
    /// buffer home; detached buffers pass through unchanged.
    pub fn unpinned(self) -> PooledBuf {
        if self.is_pooled() {
            PooledBuf::detached(self.data.clone())
        } else {
            self
        }
    }

    /// Zero-fills the payload.
    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    /// Replaces the payload with a copy of `src`, reusing the storage.
    pub fn fill_from(&mut self, src: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(src);
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            // A recreated pool drops its receiver; stale buffers are freed.
            if home.send(core::mem::take(&mut self.data)).is_ok()
                && let Some(wake) = self.wake.take()
            {
                wake.set();
            }
        }
    }
}

impl core::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

/// Fixed set of equally sized output buffers.
pub struct BufferPool {
    free: Receiver<Vec<u8>>,
    home: Sender<Vec<u8>>,
    wake: Option<Signal>,
    count: usize,
    buf_size: usize,
}

impl BufferPool {
    /// Creates `count` zeroed buffers of `buf_size` bytes.
    pub fn new(count: usize, buf_size: usize) -> Self {
        let (home, free) = crossbeam_channel::unbounded();
        for _ in 0..count {
            let _ = home.send(vec![0; buf_size]);
        }
        Self {
            free,
            home,
            wake: None,
            count,
            buf_size,
        }
    }

    /// Like [`new`](Self::new), but every returning buffer sets `wake`.
    ///
    /// The bit is set once here as well so the owner picks up the fresh
    /// buffers.
    pub fn with_signal(count: usize, buf_size: usize, wake: Signal) -> Self {
        if count > 0 {
            wake.set();
        }
        Self {
            wake: Some(wake),
            ..Self::new(count, buf_size)
        }
    }

    /// Takes a free buffer without blocking.
    ///
    /// On an empty pool the return bit is cleared and the pool rechecked,
    /// so a buffer racing the clear still wakes the owner.
    pub fn poll(&self) -> Option<PooledBuf> {
        let data = match self.free.try_recv() {
            Ok(data) => data,
            Err(_) => {
                let wake = self.wake.as_ref()?;
                wake.clear();
                let data = self.free.try_recv().ok()?;
                wake.set();
                data
            }
        };
        Some(self.lend(data))
    }

    fn lend(&self, mut data: Vec<u8>) -> PooledBuf {
        data.resize(self.buf_size, 0);
        PooledBuf {
            data,
            home: Some(self.home.clone()),
            wake: self.wake.clone(),
        }
    }

    /// Number of buffers currently in the pool (not in flight).
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total buffers owned by the pool.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Size of each buffer in bytes.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// The return bit, for pools created with one.
    pub fn signal(&self) -> Option<&Signal> {
        self.wake.as_ref()
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("count", &self.count)
            .field("available", &self.free.len())
            .field("buf_size", &self.buf_size)
            .field("bit", &self.wake.as_ref().map(Signal::bit))
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Flags carried by a data buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Zero-filled buffer sent ahead of live data.
    pub prebuffer: bool,
}

/// Metadata markers travelling in the data path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Marker {
    /// End of stream that also flushes downstream state.
    FlushingEos,
    /// Timestamp/data discontinuity (e.g. upstream suspended).
    Discontinuity,
}

/// A buffer of samples with timing.
#[derive(Debug)]
pub struct DataBuffer {
    /// Payload.
    pub payload: PooledBuf,
    /// Timestamp of the first sample, when valid.
    pub timestamp: Option<Timestamp>,
    /// Buffer flags.
    pub flags: BufferFlags,
}

/// One item on an external input's data queue.
#[derive(Debug)]
pub enum DataMessage {
    /// A data buffer.
    Buffer(DataBuffer),
    /// A metadata marker.
    Marker(Marker),
}

impl DataMessage {
    /// Returns `true` for end-of-stream and discontinuity markers.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Marker(_))
    }

    /// Returns `true` for a buffer flagged as prebuffer.
    pub fn is_prebuffer(&self) -> bool {
        matches!(self, Self::Buffer(b) if b.flags.prebuffer)
    }
}

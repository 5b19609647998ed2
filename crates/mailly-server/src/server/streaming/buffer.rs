//! Reusable encode buffers for result frames.
//!
//! Every emitted result is serialized into a scratch [`BytesMut`] before it is
//! written to the response. Frames are small and numerous, so buffers are
//! recycled through a process-wide [`BufferPool`] rather than allocated per
//! frame.

use bytes::BytesMut;
use core::ops::{Deref, DerefMut};
use parking_lot::Mutex;

/// Starting capacity of a freshly allocated buffer. Enough for a result with
/// a long recipient and a typical SMTP error line.
pub const DEFAULT_BUFFER_CAPACITY: usize = 512;

/// Buffers that grew past this are dropped instead of returned, so one
/// oversized frame does not pin memory for the life of the process.
pub const MAX_RETAINED_CAPACITY: usize = 16 * 1024;

#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self::with_capacity(max_pooled, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(max_pooled: usize, capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            capacity,
        }
    }

    /// Takes an empty buffer from the pool, allocating if none is free. The
    /// buffer goes back when the guard drops.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self.buffers.lock().pop();
        let mut buf = buf.unwrap_or_else(|| BytesMut::with_capacity(self.capacity));
        buf.clear();
        PooledBuffer { buf, pool: self }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn release(&self, buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    buf: BytesMut,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(core::mem::take(&mut self.buf));
    }
}

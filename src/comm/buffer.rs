//! Exchange buffers and their pool.
//!
//! A buffer moves through `FREE -> RESERVED -> FILLED -> QUEUED ->
//! IN_FLIGHT -> FREE`. Producers reserve and fill slots lock-free (the
//! reservation protocol lives in [`super::exchange`]); only the rotation
//! out of RESERVED and the queue push take a lock. The pool grows on
//! demand and never returns memory during a run; the bound is
//! `comm_size * SEND_BUFFER_LIMIT` buffers in queues plus one current
//! buffer per destination.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::params::COMM_BUFFER_SIZE;

/// One exchange buffer: a fixed array of u32 slots written concurrently by
/// reserving producers.
pub struct CommChunk {
    words: Box<[UnsafeCell<u32>]>,
}

// SAFETY: concurrent writers touch disjoint reserved ranges; the
// reservation counter serializes range grants and the FILLED count orders
// every write before the buffer is read for sending.
unsafe impl Send for CommChunk {}
unsafe impl Sync for CommChunk {}

impl CommChunk {
    /// Allocates one zero-filled buffer.
    pub fn new_boxed() -> Box<Self> {
        let words = (0..COMM_BUFFER_SIZE)
            .map(|_| UnsafeCell::new(0u32))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { words })
    }

    /// Capacity in u32 slots.
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Copies `src` into the buffer at `offset`.
    ///
    /// # Safety
    /// The caller must hold a reservation covering
    /// `offset .. offset + src.len()` granted by the exchange protocol; no
    /// other thread may hold an overlapping reservation.
    #[inline]
    pub unsafe fn write(&self, offset: usize, src: &[u32]) {
        debug_assert!(offset + src.len() <= self.words.len());
        let base = self.words.as_ptr() as *mut u32;
        // SAFETY: range is inside the allocation and exclusively reserved.
        std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), src.len());
    }

    /// Reads back the filled prefix.
    ///
    /// # Safety
    /// Callable only after the protocol has quiesced the buffer: every
    /// reservation up to `len` has completed its write (`filled == len`)
    /// and no new reservations can be granted.
    #[inline]
    pub unsafe fn filled_slice(&self, len: usize) -> &[u32] {
        debug_assert!(len <= self.words.len());
        // SAFETY: quiesced per the contract; UnsafeCell<u32> has u32's layout.
        std::slice::from_raw_parts(self.words.as_ptr() as *const u32, len)
    }
}

/// Concurrent free list of exchange buffers.
pub struct BufferPool {
    free: Mutex<Vec<Box<CommChunk>>>,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Creates a pool with `prealloc` buffers ready.
    pub fn new(prealloc: usize) -> Self {
        let free = (0..prealloc).map(|_| CommChunk::new_boxed()).collect();
        Self {
            free: Mutex::new(free),
            allocated: AtomicUsize::new(prealloc),
        }
    }

    /// Takes a buffer, allocating if the free list is empty. Allocation
    /// failure aborts the process (out-of-memory is fatal here).
    pub fn take(&self) -> Box<CommChunk> {
        if let Some(buf) = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
        {
            return buf;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        CommChunk::new_boxed()
    }

    /// Returns a buffer to the free list.
    pub fn put(&self, buf: Box<CommChunk>) {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(buf);
    }

    /// Buffers allocated over the pool's lifetime.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let chunk = CommChunk::new_boxed();
        // SAFETY: single-threaded test owns the whole buffer.
        unsafe {
            chunk.write(0, &[1, 2, 3]);
            chunk.write(3, &[4]);
            assert_eq!(chunk.filled_slice(4), &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn pool_grows_and_recycles() {
        let pool = BufferPool::new(1);
        let a = pool.take();
        let b = pool.take();
        assert_eq!(pool.allocated(), 2);
        pool.put(a);
        pool.put(b);
        let _c = pool.take();
        assert_eq!(pool.allocated(), 2);
    }
}

// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A pool of reusable payload allocations.
//!
//! Grounded in the driver's `Reusable`/`Payloads` slots (a fixed vector of
//! recyclable buffers handed to reporters so they don't reallocate per
//! request). Here the pool is a plain `Mutex`-guarded free list rather than
//! an `UnsafeCell`-based fixed array, since messages are sized dynamically
//! and come from many concurrent consumers rather than one shard loop.

use std::sync::Mutex;

/// A thread-safe free list of recycled byte buffers.
///
/// Invisible to [`crate::message::Message`] callers: a pool miss just means
/// a fresh allocation, so correctness never depends on the pool being warm.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer with at least `capacity` bytes of capacity, reusing a
    /// pooled allocation if one is large enough.
    pub fn take(&self, capacity: usize) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        if let Some(pos) = free.iter().position(|b| b.capacity() >= capacity) {
            let mut buf = free.swap_remove(pos);
            buf.clear();
            buf
        } else {
            Vec::with_capacity(capacity)
        }
    }

    /// Return a buffer to the pool for later reuse. Its length is reset to
    /// zero but its capacity is preserved.
    pub fn release(&self, mut buf: Vec<u8>) {
        const MAX_POOLED: usize = 256;
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    /// Number of buffers currently parked in the pool. Advisory only.
    pub fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Whether the pool currently holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_then_take_reuses_allocation() {
        let pool = BufferPool::new();
        let buf = Vec::with_capacity(64);
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.len(), 1);
        let reused = pool.take(32);
        assert_eq!(reused.as_ptr(), ptr);
        assert!(pool.is_empty());
    }

    #[test]
    fn take_falls_back_to_fresh_allocation() {
        let pool = BufferPool::new();
        let buf = pool.take(16);
        assert!(buf.capacity() >= 16);
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! RAII buffer guard that frees a pool allocation on drop.
//!
//! [`PoolBuffer`] pairs the raw `allocate`/`free` contract into a safe
//! handle: the guard owns the pointer and its size, keeps the pool alive
//! through an `Arc`, and returns the bytes when dropped. The borrow
//! checker prevents use-after-free at compile time.

use crate::pool::MemoryPool;
use crate::MemoryError;
use std::ptr::NonNull;
use std::sync::Arc;

/// An RAII guard over a single pool allocation.
///
/// # Example
/// ```
/// use query_memory::MemoryManager;
///
/// let manager = MemoryManager::new();
/// let pool = manager.root().add_child("scan", None);
///
/// let buffer = pool.allocate_buffer(4096).unwrap();
/// assert_eq!(pool.current_bytes(), 4096);
///
/// drop(buffer);
/// assert_eq!(pool.current_bytes(), 0);
/// ```
pub struct PoolBuffer {
    ptr: NonNull<u8>,
    size: usize,
    pool: Arc<MemoryPool>,
}

impl MemoryPool {
    /// Allocates `size` bytes wrapped in a guard that frees them on drop.
    pub fn allocate_buffer(&self, size: usize) -> Result<PoolBuffer, MemoryError> {
        let pool = self.handle();
        let ptr = self.allocate(size)?;
        Ok(PoolBuffer { ptr, size, pool })
    }
}

impl PoolBuffer {
    /// Immutable view of the buffer. Fresh allocations are zeroed.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the guard owns `size` initialized bytes at `ptr`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Mutable view of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the guard owns `size` initialized bytes at `ptr`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Size of this allocation as requested from the pool.
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    /// The pool this buffer is attributed to.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` are exactly what `allocate` returned and
        // the guard is the only owner.
        unsafe { self.pool.free(self.ptr, self.size) };
    }
}

// PoolBuffer is Send because the allocation is exclusively owned and the
// pool handle is an Arc. It is NOT Sync: &mut access isn't synchronized.
unsafe impl Send for PoolBuffer {}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("size_bytes", &self.size)
            .field("pool", &self.pool.name())
            .finish()
    }
}

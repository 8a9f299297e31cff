// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Container-facing typed allocator adapter.
//!
//! [`PoolAllocator`] is a small value-semantic handle that adapts a
//! [`MemoryPool`](crate::MemoryPool) to element-count allocation the way
//! generic containers want it. Every request is checked: an element
//! count whose byte size would overflow the 63-bit range is rejected
//! before it can reach the pool, on deallocation as well as allocation.

use crate::pool::MemoryPool;
use crate::MemoryError;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

/// Typed, checked allocation facade over a pool.
pub struct PoolAllocator<T> {
    pool: Arc<MemoryPool>,
    _marker: PhantomData<T>,
}

impl<T> PoolAllocator<T> {
    /// Creates an adapter for `pool`.
    ///
    /// The element type must not need stricter alignment than the pool's
    /// allocations provide.
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        debug_assert!(std::mem::align_of::<T>() <= pool.effective_alignment());
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Allocates space for `count` elements.
    pub fn allocate(&self, count: usize) -> Result<NonNull<T>, MemoryError> {
        let bytes = Self::checked_bytes(count)?;
        Ok(self.pool.allocate(bytes)?.cast())
    }

    /// Returns space for `count` elements. A null `ptr` is ignored, but
    /// the count is validated regardless.
    ///
    /// # Safety
    /// A non-null `ptr` must come from `allocate` on this adapter with the
    /// same `count`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: *mut T, count: usize) -> Result<(), MemoryError> {
        let bytes = Self::checked_bytes(count)?;
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: forwarded caller contract.
            unsafe { self.pool.free(ptr.cast(), bytes) };
        }
        Ok(())
    }

    /// The pool behind this adapter.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    fn checked_bytes(count: usize) -> Result<usize, MemoryError> {
        let unit = std::mem::size_of::<T>();
        let overflow = MemoryError::SizeOverflow { count, unit };
        let bytes = count.checked_mul(unit).ok_or(overflow)?;
        if bytes as u64 > i64::MAX as u64 {
            return Err(MemoryError::SizeOverflow { count, unit });
        }
        Ok(bytes)
    }
}

impl<T> Clone for PoolAllocator<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for PoolAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("pool", &self.pool.name())
            .field("element_size", &std::mem::size_of::<T>())
            .finish()
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The byte-source seam: the [`ByteAllocator`] trait, the plain heap
//! variant, and the process-wide default-instance registry.
//!
//! Pools never touch raw memory themselves — they account and delegate.
//! The allocator behind a tree is chosen once, at manager construction,
//! and must outlive every pool that uses it.

use crate::MemoryError;
use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Mutex;

/// Alignment used when a pool was built with no explicit alignment.
/// Matches what `malloc` guarantees on 64-bit platforms.
pub(crate) const DEFAULT_ALIGNMENT: usize = 16;

/// Source of raw aligned bytes shared by a whole pool tree.
///
/// `free` and `reallocate` are `unsafe`: the caller must pass a pointer
/// previously returned by this allocator together with the same size it
/// was requested with (sized deallocation, as in [`std::alloc`]).
///
/// The page-counter accessors report zero unless the variant actually
/// maps pages (see [`MmapAllocator`](crate::MmapAllocator)).
pub trait ByteAllocator: Send + Sync + fmt::Debug {
    /// Returns `size` zeroed bytes aligned to `align`.
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Returns bytes to the allocator.
    ///
    /// # Safety
    /// `ptr` must come from `allocate`/`reallocate` on this allocator with
    /// the same `size` and `align`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Resizes an allocation, preserving the first `min(old_size, new_size)`
    /// bytes. Any extension is uninitialized. On failure the original
    /// allocation is left untouched.
    ///
    /// # Safety
    /// Same contract as [`ByteAllocator::free`] for `ptr` and `old_size`.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let new_ptr = self.allocate(new_size, align)?;
        let preserved = old_size.min(new_size);
        if preserved > 0 {
            // SAFETY: both regions are at least `preserved` bytes and distinct.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), preserved);
            }
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.free(ptr, old_size, align) };
        Ok(new_ptr)
    }

    /// Ordered page-run sizes handed out by a page-class allocator.
    fn size_classes(&self) -> &[usize] {
        &[]
    }

    /// Pages currently issued to callers (size-class and external paths).
    fn num_allocated(&self) -> u64 {
        0
    }

    /// Pages currently mapped in the size-class pool.
    fn num_mapped(&self) -> u64 {
        0
    }

    /// Pages currently mapped via the external path.
    fn num_external_mapped(&self) -> u64 {
        0
    }
}

/// Placeholder pointer for zero-size requests: non-null, aligned, never
/// dereferenced, never passed to the underlying byte source.
pub(crate) fn dangling(align: usize) -> NonNull<u8> {
    debug_assert!(align.is_power_of_two());
    // SAFETY: a power of two is never zero.
    unsafe { NonNull::new_unchecked(align as *mut u8) }
}

/// A thin wrapper over the process heap. No page accounting.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl HeapAllocator {
    /// Creates a heap allocator.
    pub fn new() -> Self {
        Self
    }

    fn layout(size: usize, align: usize) -> Result<Layout, MemoryError> {
        Layout::from_size_align(size, align)
            .map_err(|e| MemoryError::AllocationFailed(format!("invalid layout: {e}")))
    }
}

impl ByteAllocator for HeapAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Ok(dangling(align));
        }
        let layout = Self::layout(size, align)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            MemoryError::AllocationFailed(format!("heap allocation of {size} bytes failed"))
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        if size == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(size, align) {
            // SAFETY: caller passes the pointer and layout it allocated with.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        if old_size == 0 {
            return self.allocate(new_size, align);
        }
        if new_size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr, old_size, align) };
            return Ok(dangling(align));
        }
        let layout = Self::layout(old_size, align)?;
        // SAFETY: caller passes the pointer and layout it allocated with;
        // new_size was validated to fit the size range by the pool.
        let new_ptr = unsafe { std::alloc::realloc(ptr.as_ptr(), layout, new_size) };
        NonNull::new(new_ptr).ok_or_else(|| {
            MemoryError::AllocationFailed(format!(
                "heap reallocation from {old_size} to {new_size} bytes failed"
            ))
        })
    }
}

/// The process-wide default allocator slot.
///
/// A [`MemoryManager`](crate::MemoryManager) installs its allocator here on
/// construction and removes it on drop, so detached components (caches,
/// spill buffers) can reach the same byte source without threading a handle
/// through every call site.
static DEFAULT_INSTANCE: Mutex<Option<std::sync::Arc<dyn ByteAllocator>>> = Mutex::new(None);

/// Returns the currently installed default allocator, if any.
pub fn default_byte_allocator() -> Option<std::sync::Arc<dyn ByteAllocator>> {
    DEFAULT_INSTANCE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

/// Installs (or clears) the process default allocator.
pub fn set_default_byte_allocator(allocator: Option<std::sync::Arc<dyn ByteAllocator>>) {
    let mut slot = DEFAULT_INSTANCE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match &allocator {
        Some(_) => tracing::debug!("installing process default byte allocator"),
        None => tracing::debug!("clearing process default byte allocator"),
    }
    *slot = allocator;
}

/// Clears the default slot only if it still holds `allocator`.
///
/// Used by manager teardown so a manager never evicts an allocator
/// installed by a younger manager.
pub(crate) fn clear_default_byte_allocator_if(allocator: &std::sync::Arc<dyn ByteAllocator>) {
    let mut slot = DEFAULT_INSTANCE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(current) = slot.as_ref() {
        if std::sync::Arc::ptr_eq(current, allocator) {
            *slot = None;
        }
    }
}

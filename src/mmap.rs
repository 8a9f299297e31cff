// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Page-class `mmap`-backed byte allocator.
//!
//! Requests are converted to 4 KiB pages and served one of two ways:
//!
//! 1. **Size-class path** — requests up to the largest size class get a
//!    page run of the smallest class that fits. Freed runs go onto a
//!    per-class free list and stay mapped for reuse, so `num_mapped`
//!    never shrinks on this path.
//! 2. **External path** — larger requests get their own private
//!    anonymous mapping of exactly the requested page count, released
//!    back to the kernel on free.
//!
//! `capacity` bounds the pages the allocator will have issued at any
//! moment; exhausting it fails with a cap-exceeded error.

use crate::alloc::{dangling, ByteAllocator};
use crate::MemoryError;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Bookkeeping unit of the allocator.
pub const PAGE_SIZE: usize = 4096;

/// Page-run sizes handed out by the size-class path, in pages.
const SIZE_CLASSES: [usize; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

/// Construction parameters for [`MmapAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct MmapAllocatorOptions {
    /// Maximum bytes the allocator will have issued at any moment.
    pub capacity: usize,
}

impl Default for MmapAllocatorOptions {
    fn default() -> Self {
        Self {
            capacity: 8 << 30, // 8 GiB
        }
    }
}

/// A page-class allocator backed by anonymous private mappings.
pub struct MmapAllocator {
    capacity_pages: u64,
    /// Freed-but-still-mapped runs, one list per size class.
    free_runs: [Mutex<Vec<NonNull<u8>>>; SIZE_CLASSES.len()],
    num_allocated: AtomicU64,
    num_mapped: AtomicU64,
    num_external_mapped: AtomicU64,
}

// SAFETY: the raw run pointers on the free lists are owned exclusively by
// the allocator (behind a Mutex) and only ever handed out once at a time.
unsafe impl Send for MmapAllocator {}
unsafe impl Sync for MmapAllocator {}

impl MmapAllocator {
    /// Creates an allocator with the given options.
    pub fn new(options: MmapAllocatorOptions) -> Self {
        Self {
            capacity_pages: (options.capacity / PAGE_SIZE) as u64,
            free_runs: std::array::from_fn(|_| Mutex::new(Vec::new())),
            num_allocated: AtomicU64::new(0),
            num_mapped: AtomicU64::new(0),
            num_external_mapped: AtomicU64::new(0),
        }
    }

    /// Pages needed to hold `bytes`, rounded up.
    fn pages_for(bytes: usize) -> u64 {
        bytes.div_ceil(PAGE_SIZE) as u64
    }

    /// Index of the smallest size class holding `pages`, or `None` for the
    /// external path.
    fn class_index(pages: u64) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&c| c as u64 >= pages)
    }

    /// Reserves `pages` against the capacity. Atomic: concurrent callers
    /// can never overshoot together.
    fn try_issue(&self, pages: u64) -> bool {
        self.num_allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |issued| {
                let next = issued.checked_add(pages)?;
                (next <= self.capacity_pages).then_some(next)
            })
            .is_ok()
    }

    fn capacity_error(&self, requested: usize) -> MemoryError {
        MemoryError::AllocatorCapExceeded {
            capacity: (self.capacity_pages as i64) * PAGE_SIZE as i64,
            requested: requested as i64,
        }
    }
}

impl ByteAllocator for MmapAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Ok(dangling(align));
        }
        let pages = Self::pages_for(size);
        match Self::class_index(pages) {
            Some(idx) => {
                let class_pages = SIZE_CLASSES[idx] as u64;
                if !self.try_issue(class_pages) {
                    return Err(self.capacity_error(size));
                }
                let reused = self.free_runs[idx]
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .pop();
                if let Some(run) = reused {
                    return Ok(run);
                }
                match map_pages(SIZE_CLASSES[idx]) {
                    Ok(run) => {
                        self.num_mapped.fetch_add(class_pages, Ordering::AcqRel);
                        Ok(run)
                    }
                    Err(e) => {
                        self.num_allocated.fetch_sub(class_pages, Ordering::AcqRel);
                        Err(e)
                    }
                }
            }
            None => {
                if !self.try_issue(pages) {
                    return Err(self.capacity_error(size));
                }
                match map_pages(pages as usize) {
                    Ok(run) => {
                        self.num_external_mapped.fetch_add(pages, Ordering::AcqRel);
                        Ok(run)
                    }
                    Err(e) => {
                        self.num_allocated.fetch_sub(pages, Ordering::AcqRel);
                        Err(e)
                    }
                }
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, _align: usize) {
        if size == 0 {
            return;
        }
        let pages = Self::pages_for(size);
        match Self::class_index(pages) {
            Some(idx) => {
                // The run stays mapped for reuse.
                self.free_runs[idx]
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(ptr);
                self.num_allocated
                    .fetch_sub(SIZE_CLASSES[idx] as u64, Ordering::AcqRel);
            }
            None => {
                // SAFETY: caller passes a pointer obtained from `allocate`
                // with the same size, so this is a whole external mapping.
                unsafe { unmap_pages(ptr, pages as usize) };
                self.num_allocated.fetch_sub(pages, Ordering::AcqRel);
                self.num_external_mapped.fetch_sub(pages, Ordering::AcqRel);
            }
        }
    }

    fn size_classes(&self) -> &[usize] {
        &SIZE_CLASSES
    }

    fn num_allocated(&self) -> u64 {
        self.num_allocated.load(Ordering::Acquire)
    }

    fn num_mapped(&self) -> u64 {
        self.num_mapped.load(Ordering::Acquire)
    }

    fn num_external_mapped(&self) -> u64 {
        self.num_external_mapped.load(Ordering::Acquire)
    }
}

impl Drop for MmapAllocator {
    fn drop(&mut self) {
        for (idx, list) in self.free_runs.iter_mut().enumerate() {
            let runs = list
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for run in runs.drain(..) {
                // SAFETY: free-listed runs are whole mappings of their class.
                unsafe { unmap_pages(run, SIZE_CLASSES[idx]) };
            }
        }
        let leaked = self.num_allocated.load(Ordering::Acquire);
        if leaked > 0 {
            tracing::warn!(pages = leaked, "mmap allocator dropped with issued pages");
        }
    }
}

impl fmt::Debug for MmapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapAllocator")
            .field("capacity_pages", &self.capacity_pages)
            .field("num_allocated", &self.num_allocated())
            .field("num_mapped", &self.num_mapped())
            .field("num_external_mapped", &self.num_external_mapped())
            .finish()
    }
}

/// Maps `pages` fresh zeroed pages.
fn map_pages(pages: usize) -> Result<NonNull<u8>, MemoryError> {
    let len = pages * PAGE_SIZE;
    // SAFETY: anonymous private mapping, no file descriptor involved.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed(format!(
            "mmap of {len} bytes failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: mmap success is never the null page.
    Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
}

/// Releases a mapping back to the kernel.
///
/// # Safety
/// `ptr` must be the base of a live mapping of exactly `pages` pages.
unsafe fn unmap_pages(ptr: NonNull<u8>, pages: usize) {
    let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, pages * PAGE_SIZE) };
    if rc != 0 {
        tracing::warn!(
            pages,
            error = %std::io::Error::last_os_error(),
            "munmap failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_allocator(capacity_pages: usize) -> MmapAllocator {
        MmapAllocator::new(MmapAllocatorOptions {
            capacity: capacity_pages * PAGE_SIZE,
        })
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(MmapAllocator::pages_for(1), 1);
        assert_eq!(MmapAllocator::pages_for(PAGE_SIZE), 1);
        assert_eq!(MmapAllocator::pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(MmapAllocator::pages_for(6 * PAGE_SIZE), 6);
    }

    #[test]
    fn test_class_selection() {
        assert_eq!(MmapAllocator::class_index(1), Some(0));
        assert_eq!(MmapAllocator::class_index(3), Some(2));
        assert_eq!(MmapAllocator::class_index(6), Some(3));
        assert_eq!(MmapAllocator::class_index(256), Some(8));
        assert_eq!(MmapAllocator::class_index(257), None);
    }

    #[test]
    fn test_size_class_counters() {
        let alloc = small_allocator(1024);
        // 6 pages round up to the 8-page class.
        let ptr = alloc.allocate(6 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(alloc.num_allocated(), 8);
        assert_eq!(alloc.num_mapped(), 8);
        assert_eq!(alloc.num_external_mapped(), 0);

        unsafe { alloc.free(ptr, 6 * PAGE_SIZE, PAGE_SIZE) };
        assert_eq!(alloc.num_allocated(), 0);
        // The run stays mapped on the free list.
        assert_eq!(alloc.num_mapped(), 8);
    }

    #[test]
    fn test_free_list_reuse_keeps_mapped_flat() {
        let alloc = small_allocator(1024);
        let ptr = alloc.allocate(2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { alloc.free(ptr, 2 * PAGE_SIZE, PAGE_SIZE) };
        let mapped = alloc.num_mapped();

        let again = alloc.allocate(2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(alloc.num_mapped(), mapped);
        assert_eq!(again.as_ptr(), ptr.as_ptr());
        unsafe { alloc.free(again, 2 * PAGE_SIZE, PAGE_SIZE) };
    }

    #[test]
    fn test_external_counters() {
        let alloc = small_allocator(4096);
        let pages = 256 + 56;
        let ptr = alloc.allocate(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(alloc.num_allocated(), pages as u64);
        assert_eq!(alloc.num_external_mapped(), pages as u64);
        assert_eq!(alloc.num_mapped(), 0);

        unsafe { alloc.free(ptr, pages * PAGE_SIZE, PAGE_SIZE) };
        assert_eq!(alloc.num_allocated(), 0);
        assert_eq!(alloc.num_external_mapped(), 0);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let alloc = small_allocator(8);
        let ptr = alloc.allocate(8 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let err = alloc.allocate(PAGE_SIZE, PAGE_SIZE).unwrap_err();
        assert!(matches!(err, MemoryError::AllocatorCapExceeded { .. }));
        assert!(err.is_retriable());

        unsafe { alloc.free(ptr, 8 * PAGE_SIZE, PAGE_SIZE) };
        assert!(alloc.allocate(PAGE_SIZE, PAGE_SIZE).is_ok());
    }

    #[test]
    fn test_memory_is_writable() {
        let alloc = small_allocator(64);
        let ptr = alloc.allocate(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 3 * PAGE_SIZE);
            assert_eq!(*ptr.as_ptr().add(3 * PAGE_SIZE - 1), 0x5A);
            alloc.free(ptr, 3 * PAGE_SIZE, PAGE_SIZE);
        }
    }
}
